//! `ServiceLauncher` over `std::process::Command`, and `PortDiscovery` over
//! `/proc/net/tcp`+`/proc/net/udp` cross-referenced against `/proc/<pid>/fd/*`
//! — a structured `proc(5)` read rather than a textual `netstat` scrape.

use mesh_core::error::LaunchError;
use mesh_core::service::{ChildHandle, PortDiscovery, ServiceLauncher};
use std::collections::HashSet;
use std::process::{Child, Command};
use std::sync::Mutex;

/// Launches the configured service executable as a child process and keeps
/// its handle around so `stop` can signal it.
#[derive(Debug)]
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    children: Mutex<std::collections::HashMap<u32, Child>>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        ProcessLauncher { program: program.into(), args, children: Mutex::new(Default::default()) }
    }
}

impl ServiceLauncher for ProcessLauncher {
    fn launch(&self) -> Result<ChildHandle, LaunchError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .spawn()
            .map_err(|e| LaunchError::ExecFailed(e.to_string()))?;
        let pid = child.id();
        self.children.lock().unwrap().insert(pid, child);
        Ok(ChildHandle { pid })
    }

    fn stop(&self, child: ChildHandle) {
        let mut children = self.children.lock().unwrap();
        if let Some(mut proc) = children.remove(&child.pid) {
            if let Err(e) = proc.kill() {
                log::warn!("failed to kill service pid {}: {e}", child.pid);
            }
            let _ = proc.wait();
        }
    }
}

/// Parses one line of `/proc/net/tcp`/`/proc/net/udp`: returns
/// `(local_port, inode)` for sockets in the listening state (`0A` for TCP;
/// UDP has no listening state, every bound socket counts).
fn parse_proc_net_line(line: &str, is_tcp: bool) -> Option<(u16, u64)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    if is_tcp && fields[3] != "0A" {
        return None;
    }
    let local = fields[1];
    let port_hex = local.rsplit(':').next()?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let inode: u64 = fields[9].parse().ok()?;
    Some((port, inode))
}

fn listening_sockets(path: &str, is_tcp: bool) -> Vec<(u16, u64)> {
    let Ok(contents) = std::fs::read_to_string(path) else { return Vec::new() };
    contents.lines().skip(1).filter_map(|line| parse_proc_net_line(line, is_tcp)).collect()
}

/// The inode numbers of every file descriptor open in `pid`'s `/proc/<pid>/fd`.
fn fd_inodes(pid: u32) -> HashSet<u64> {
    let Ok(entries) = std::fs::read_dir(format!("/proc/{pid}/fd")) else { return HashSet::new() };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| std::fs::read_link(entry.path()).ok())
        .filter_map(|target| {
            let s = target.to_string_lossy();
            s.strip_prefix("socket:[").and_then(|s| s.strip_suffix(']')).and_then(|s| s.parse().ok())
        })
        .collect()
}

/// Cross-references `/proc/net/{tcp,udp}` listening sockets against `pid`'s
/// open file descriptors.
#[derive(Debug, Default)]
pub struct ProcPortDiscovery;

impl PortDiscovery for ProcPortDiscovery {
    fn listening_ports(&self, pid: u32) -> Vec<u16> {
        let inodes = fd_inodes(pid);
        if inodes.is_empty() {
            return Vec::new();
        }
        let mut ports: Vec<u16> = listening_sockets("/proc/net/tcp", true)
            .into_iter()
            .chain(listening_sockets("/proc/net/udp", false))
            .filter(|(_, inode)| inodes.contains(inode))
            .map(|(port, _)| port)
            .collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_a_listening_tcp_line() {
        let line = "   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 123456 1 0000000000000000 100 0 0 10 0";
        assert_eq!(parse_proc_net_line(line, true), Some((8080, 123456)));
    }

    #[test]
    fn skips_a_non_listening_tcp_line() {
        let line = "   1: 0100007F:1F90 0100007F:C350 01 00000000:00000000 00:00000000 00000000  1000        0 123457 1 0000000000000000 100 0 0 10 0";
        assert_eq!(parse_proc_net_line(line, true), None);
    }

    #[test]
    fn launch_and_stop_a_real_process() {
        let launcher = ProcessLauncher::new("sleep", vec!["5".into()]);
        let handle = launcher.launch().unwrap();
        assert!(handle.pid > 0);
        launcher.stop(handle);
    }

    #[test]
    fn current_process_has_no_listening_ports_reported_without_matching_fds() {
        let discovery = ProcPortDiscovery;
        // The test harness process itself is very unlikely to hold an open
        // listening socket with no other fd aliasing it, but the call must
        // not panic regardless of what it finds.
        let _ = discovery.listening_ports(std::process::id());
    }
}
