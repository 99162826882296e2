//! `LoadSampler` over `/proc/<pid>/stat`: samples CPU percentage and RSS
//! percentage of system memory on a background timer, averaging whatever
//! accumulated since the last drain.

use mesh_core::inspector::LoadSampler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn clock_ticks_per_sec() -> u64 {
    // sysconf(_SC_CLK_TCK) is 100 on every Linux target we run on; avoid a
    // libc dependency for a single constant.
    100
}

fn total_memory_kb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? == "MemTotal:" {
            parts.next()?.parse().ok()
        } else {
            None
        }
    })
}

/// `(utime+stime ticks, rss pages)` read from `/proc/<pid>/stat` fields 14,
/// 15 and 24. Returns `None` if the process has exited or the file is
/// malformed.
fn read_proc_stat(pid: u32) -> Option<(u64, u64)> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Field 2 (comm) is parenthesized and may itself contain spaces/parens;
    // skip past the last ')' before splitting the rest on whitespace.
    let after_comm = contents.rfind(')')?;
    let rest: Vec<&str> = contents[after_comm + 1..].split_whitespace().collect();
    // rest[0] is field 3 (state); utime is field 14 -> rest[11], stime is
    // field 15 -> rest[12], rss is field 24 -> rest[21].
    let utime: u64 = rest.get(11)?.parse().ok()?;
    let stime: u64 = rest.get(12)?.parse().ok()?;
    let rss: u64 = rest.get(21)?.parse().ok()?;
    Some((utime + stime, rss))
}

struct Samples {
    cpu: Vec<f64>,
    ram: Vec<f64>,
}

/// Samples a child process's CPU and RAM utilization once per
/// `sample_interval` until dropped or cancelled, and hands back the running
/// average on [`LoadSampler::drain`].
#[derive(Debug)]
pub struct ProcLoadSampler {
    samples: Arc<Mutex<Samples>>,
    cancelled: Arc<AtomicBool>,
}

impl std::fmt::Debug for Samples {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Samples").field("count", &self.cpu.len()).finish()
    }
}

impl ProcLoadSampler {
    /// Spawns the sampling thread for `pid`, polling every `sample_interval`.
    pub fn spawn(pid: u32, sample_interval: Duration) -> Arc<Self> {
        let sampler = Arc::new(ProcLoadSampler {
            samples: Arc::new(Mutex::new(Samples { cpu: Vec::new(), ram: Vec::new() })),
            cancelled: Arc::new(AtomicBool::new(false)),
        });

        let samples = Arc::clone(&sampler.samples);
        let cancelled = Arc::clone(&sampler.cancelled);
        std::thread::spawn(move || {
            let ticks_per_sec = clock_ticks_per_sec() as f64;
            let total_kb = total_memory_kb().unwrap_or(1);
            let mut last = read_proc_stat(pid);
            while !cancelled.load(Ordering::SeqCst) {
                std::thread::sleep(sample_interval);
                let Some((ticks, rss_pages)) = read_proc_stat(pid) else { break };
                if let Some((last_ticks, _)) = last {
                    let delta_ticks = ticks.saturating_sub(last_ticks) as f64;
                    let cpu_pct = (delta_ticks / ticks_per_sec) / sample_interval.as_secs_f64() * 100.0;
                    let rss_kb = rss_pages * 4; // PAGESIZE is 4 KiB on every target we run on.
                    let ram_pct = rss_kb as f64 / total_kb as f64 * 100.0;
                    let mut guard = samples.lock().unwrap();
                    guard.cpu.push(cpu_pct);
                    guard.ram.push(ram_pct);
                }
                last = Some((ticks, rss_pages));
            }
        });

        sampler
    }

    /// Stops the sampling thread.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl LoadSampler for ProcLoadSampler {
    fn drain(&self) -> (f64, f64) {
        let mut guard = self.samples.lock().unwrap();
        let avg = |v: &[f64]| if v.is_empty() { 0.0 } else { v.iter().sum::<f64>() / v.len() as f64 };
        let result = (avg(&guard.cpu), avg(&guard.ram));
        guard.cpu.clear();
        guard.ram.clear();
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn drain_of_an_unsampled_process_is_zero() {
        let sampler = ProcLoadSampler::spawn(std::process::id(), Duration::from_secs(60));
        assert_eq!(sampler.drain(), (0.0, 0.0));
        sampler.cancel();
    }

    #[test]
    fn sampling_the_current_process_eventually_produces_nonzero_ram() {
        let sampler = ProcLoadSampler::spawn(std::process::id(), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(80));
        let (_, ram) = sampler.drain();
        sampler.cancel();
        assert!(ram > 0.0, "expected nonzero RSS share for the current process, got {ram}");
    }
}
