//! Master supervision loop: binds the listening socket once, re-execs
//! itself to spawn each worker with that socket inherited, restarts
//! workers that exit, and propagates termination signals.

use anyhow::{Context, Result};
use proxy_common::address;
use proxy_common::config::Config;
use socket2::{Domain, Socket, Type};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio::time::sleep;

/// Clears `FD_CLOEXEC` on `fd` so it survives the worker's `execve`.
fn clear_cloexec(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(std::io::Error::last_os_error()).context("fcntl(F_GETFD)");
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return Err(std::io::Error::last_os_error()).context("fcntl(F_SETFD)");
        }
    }
    Ok(())
}

fn bind_listener(config: &Config) -> Result<Socket> {
    let addr = address::resolve(&config.frontend.host, config.frontend.port)
        .context("resolving frontend address")?;
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, None).context("creating listening socket")?;
    socket.set_reuse_address(true).context("setting SO_REUSEADDR")?;
    socket.bind(&addr.into()).context("binding listener")?;
    socket.listen(1024).context("listen")?;
    Ok(socket)
}

fn spawn_worker(exe: &PathBuf, config_path: &PathBuf, listen_fd: RawFd) -> Result<Child> {
    Command::new(exe)
        .arg("--config")
        .arg(config_path)
        .arg("--worker")
        .arg("--listen-fd")
        .arg(listen_fd.to_string())
        .kill_on_drop(true)
        .spawn()
        .context("spawning worker process")
}

type ReapResult = (usize, u64, ExitStatus);

fn spawn_reaper(children: &mut JoinSet<ReapResult>, index: usize, generation: u64, mut child: Child) {
    children.spawn(async move {
        let status = child.wait().await.unwrap_or_else(|_| ExitStatus::from_raw(-1));
        (index, generation, status)
    });
}

/// Runs the master loop until SIGINT/SIGTERM, then waits for every
/// worker to exit before returning.
pub async fn run(config: Config, config_path: PathBuf) -> Result<()> {
    let listener = bind_listener(&config)?;
    let listen_fd = listener.as_raw_fd();
    clear_cloexec(listen_fd)?;
    // The master never accepts on this socket itself; it only holds the
    // fd open so workers can inherit it across re-exec.
    std::mem::forget(listener);

    let exe = std::env::current_exe().context("resolving current executable")?;
    let restart_timeout = Duration::from_millis(config.restart_timeout_ms);

    let mut children: JoinSet<ReapResult> = JoinSet::new();
    let mut pids: Vec<Option<u32>> = vec![None; config.workers];
    let mut generations: Vec<u64> = vec![0; config.workers];

    for index in 0..config.workers {
        let child = spawn_worker(&exe, &config_path, listen_fd)?;
        pids[index] = child.id();
        spawn_reaper(&mut children, index, generations[index], child);
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, terminating workers");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, terminating workers");
                break;
            }
            Some(result) = children.join_next() => {
                let (index, generation, exit) = result.context("worker reaper task panicked")?;
                pids[index] = None;
                tracing::warn!(worker = index, ?exit, "worker exited, restarting after delay");
                sleep(restart_timeout).await;
                match spawn_worker(&exe, &config_path, listen_fd) {
                    Ok(child) => {
                        pids[index] = child.id();
                        generations[index] = generation + 1;
                        spawn_reaper(&mut children, index, generations[index], child);
                    }
                    Err(e) => tracing::error!(worker = index, error = %e, "failed to respawn worker"),
                }
            }
        }
    }

    for pid in pids.iter().flatten() {
        unsafe {
            libc::kill(*pid as i32, libc::SIGTERM);
        }
    }
    while children.join_next().await.is_some() {}

    Ok(())
}
