//! POSIX daemonization: double-fork, detach from the controlling
//! terminal, and redirect the standard streams to `/dev/null`.

use std::ffi::CString;
use std::io;

/// Forks twice (to avoid ever re-acquiring a controlling terminal),
/// starts a new session in the intermediate child, and has the final
/// process continue with stdio redirected to `/dev/null`. The original
/// process exits immediately after the first fork.
pub fn daemonize() -> io::Result<()> {
    unsafe {
        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::setsid() == -1 {
            return Err(io::Error::last_os_error());
        }

        match libc::fork() {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::chdir(CString::new("/").unwrap().as_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }

        redirect_stdio_to_null()?;
    }
    Ok(())
}

unsafe fn redirect_stdio_to_null() -> io::Result<()> {
    unsafe {
        let dev_null = CString::new("/dev/null").unwrap();
        let fd = libc::open(dev_null.as_ptr(), libc::O_RDWR);
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if libc::dup2(fd, target) == -1 {
                return Err(io::Error::last_os_error());
            }
        }
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }
    Ok(())
}
