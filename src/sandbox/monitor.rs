use std::fmt;
use std::fs;
use std::io;
use std::time::{Duration, Instant};

use crate::config::{ByteSize, MonitorConfig};

/// One CPU/memory reading of a process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Percentage of one core since the previous sample
    pub cpu_percent: f64,
    /// Resident set size
    pub memory_bytes: u64,
}

/// Reads CPU time and resident memory of a process from procfs
pub struct ProcessSampler {
    pid: u32,
    ticks_per_second: f64,
    page_size: u64,
    previous: Option<(Instant, u64)>,
}

impl ProcessSampler {
    pub fn new(pid: u32) -> Self {
        // SAFETY: sysconf has no preconditions
        let (ticks, page_size) =
            unsafe { (libc::sysconf(libc::_SC_CLK_TCK), libc::sysconf(libc::_SC_PAGESIZE)) };

        Self {
            pid,
            ticks_per_second: if ticks > 0 { ticks as f64 } else { 100.0 },
            page_size: if page_size > 0 { page_size as u64 } else { 4096 },
            previous: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Takes a reading. The first one reports the average usage since process start.
    pub fn sample(&mut self) -> io::Result<Sample> {
        let stat = fs::read_to_string(format!("/proc/{}/stat", self.pid))?;
        let fields = parse_stat(&stat).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "malformed /proc stat line")
        })?;
        if fields.state == 'Z' {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "process has already exited",
            ));
        }

        let now = Instant::now();
        let cpu_ticks = fields.utime + fields.stime;
        let cpu_percent = match self.previous {
            Some((at, ticks)) => {
                let wall = now.duration_since(at).as_secs_f64();
                if wall > 0.0 {
                    cpu_ticks.saturating_sub(ticks) as f64 / self.ticks_per_second / wall * 100.0
                } else {
                    0.0
                }
            }
            None => self.lifetime_usage(cpu_ticks, fields.start_time)?,
        };
        self.previous = Some((now, cpu_ticks));

        Ok(Sample {
            cpu_percent,
            memory_bytes: fields.rss_pages * self.page_size,
        })
    }

    fn lifetime_usage(&self, cpu_ticks: u64, start_time: u64) -> io::Result<f64> {
        let uptime: f64 = fs::read_to_string("/proc/uptime")?
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc/uptime"))?;

        let age = uptime - start_time as f64 / self.ticks_per_second;
        if age <= 0.0 {
            return Ok(0.0);
        }
        Ok(cpu_ticks as f64 / self.ticks_per_second / age * 100.0)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct StatFields {
    state: char,
    utime: u64,
    stime: u64,
    start_time: u64,
    rss_pages: u64,
}

fn parse_stat(stat: &str) -> Option<StatFields> {
    // The command name may contain spaces and parentheses, so split after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();

    // fields[0] is field 3 (state) in proc(5) numbering
    Some(StatFields {
        state: fields.first()?.chars().next()?,
        utime: fields.get(11)?.parse().ok()?,
        stime: fields.get(12)?.parse().ok()?,
        start_time: fields.get(19)?.parse().ok()?,
        rss_pages: fields.get(21)?.parse().ok()?,
    })
}

/// Tracks whether CPU usage stays above a threshold for a sustained period
#[derive(Debug)]
pub struct CpuWatch {
    threshold: f64,
    sustain: Duration,
    high_since: Option<Instant>,
}

impl CpuWatch {
    pub fn new(threshold: f64, sustain: Duration) -> Self {
        Self {
            threshold,
            sustain,
            high_since: None,
        }
    }

    /// Feeds one reading; true once usage has been high for longer than the window
    pub fn observe(&mut self, cpu_percent: f64, now: Instant) -> bool {
        if cpu_percent <= self.threshold {
            self.high_since = None;
            return false;
        }

        match self.high_since {
            None => {
                self.high_since = Some(now);
                false
            }
            Some(since) => now.duration_since(since) > self.sustain,
        }
    }
}

/// Time since the process last produced output
#[derive(Debug)]
pub struct IdleWatch {
    timeout: Duration,
    last_activity: Instant,
}

impl IdleWatch {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_activity: now,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        self.silent_for(now) > self.timeout
    }
}

/// A threshold crossing that ends the stage
#[derive(Debug, Clone, PartialEq)]
pub enum Breach {
    HighCpu { threshold: f64, sustained: Duration },
    Memory { used: ByteSize, limit: ByteSize },
    Idle { silent_for: Duration },
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HighCpu {
                threshold,
                sustained,
            } => write!(
                f,
                "high CPU usage: above {threshold}% for more than {} ms",
                sustained.as_millis()
            ),
            Self::Memory { used, limit } => write!(
                f,
                "memory limit exceeded: used {:.1} MB of {:.1} MB",
                used.0 as f64 / 1048576.0,
                limit.0 as f64 / 1048576.0
            ),
            Self::Idle { silent_for } => write!(
                f,
                "process appears stuck: no output for {} ms",
                silent_for.as_millis()
            ),
        }
    }
}

/// CPU and memory policy for one running process
pub struct ResourceMonitor {
    sampler: ProcessSampler,
    cpu: CpuWatch,
    cpu_threshold: f64,
    cpu_sustain: Duration,
    memory_limit: ByteSize,
}

impl ResourceMonitor {
    pub fn new(pid: u32, config: &MonitorConfig) -> Self {
        let cpu_sustain = config.cpu_check_duration.into();
        Self {
            sampler: ProcessSampler::new(pid),
            cpu: CpuWatch::new(config.max_cpu_usage, cpu_sustain),
            cpu_threshold: config.max_cpu_usage,
            cpu_sustain,
            memory_limit: config.memory_limit,
        }
    }

    /// Samples the process once. Sampling failures are logged and skipped.
    pub fn check(&mut self, now: Instant) -> Option<Breach> {
        let sample = match self.sampler.sample() {
            Ok(sample) => sample,
            Err(e) => {
                log::debug!("Sampling process {} failed: {e}", self.sampler.pid());
                return None;
            }
        };
        log::trace!(
            "Process {}: cpu {:.1}%, rss {} bytes",
            self.sampler.pid(),
            sample.cpu_percent,
            sample.memory_bytes
        );

        if self.cpu.observe(sample.cpu_percent, now) {
            return Some(Breach::HighCpu {
                threshold: self.cpu_threshold,
                sustained: self.cpu_sustain,
            });
        }
        if sample.memory_bytes > self.memory_limit.0 {
            return Some(Breach::Memory {
                used: ByteSize(sample.memory_bytes),
                limit: self.memory_limit,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const STAT_LINE: &str = "4242 (my (odd) prog) R 1 4242 4242 34816 4242 4194304 120 0 0 0 \
        250 50 0 0 20 0 1 0 98765 10485760 2560 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";

    #[test]
    fn test_parse_stat() {
        assert_eq!(
            parse_stat(STAT_LINE),
            Some(StatFields {
                state: 'R',
                utime: 250,
                stime: 50,
                start_time: 98765,
                rss_pages: 2560,
            })
        );
        assert_eq!(parse_stat("garbage"), None);
        assert_eq!(parse_stat("1 (short) S 1 2"), None);
    }

    #[test]
    fn test_cpu_breach_must_be_sustained() {
        let start = Instant::now();
        let mut watch = CpuWatch::new(85.0, Duration::from_millis(6000));

        assert!(!watch.observe(99.0, start));
        assert!(!watch.observe(99.0, start + Duration::from_millis(3000)));
        // A momentary dip resets the window
        assert!(!watch.observe(10.0, start + Duration::from_millis(3500)));
        assert!(!watch.observe(99.0, start + Duration::from_millis(4000)));
        assert!(!watch.observe(99.0, start + Duration::from_millis(9000)));
        assert!(watch.observe(99.0, start + Duration::from_millis(10_500)));
    }

    #[test]
    fn test_idle_watch() {
        let start = Instant::now();
        let mut idle = IdleWatch::new(Duration::from_millis(300), start);
        assert!(!idle.is_idle(start + Duration::from_millis(200)));
        idle.touch(start + Duration::from_millis(250));
        assert!(!idle.is_idle(start + Duration::from_millis(500)));
        assert!(idle.is_idle(start + Duration::from_millis(600)));
        assert_eq!(
            idle.silent_for(start + Duration::from_millis(600)),
            Duration::from_millis(350)
        );
    }

    #[test]
    fn test_breach_reasons() {
        let cpu = Breach::HighCpu {
            threshold: 85.0,
            sustained: Duration::from_millis(6000),
        };
        assert_eq!(
            cpu.to_string(),
            "high CPU usage: above 85% for more than 6000 ms"
        );
        let memory = Breach::Memory {
            used: ByteSize::from_mib(900),
            limit: ByteSize::from_mib(800),
        };
        assert!(memory.to_string().starts_with("memory limit exceeded"));
        let idle = Breach::Idle {
            silent_for: Duration::from_millis(30_500),
        };
        assert_eq!(
            idle.to_string(),
            "process appears stuck: no output for 30500 ms"
        );
    }

    #[test]
    fn test_sample_own_process() {
        let mut sampler = ProcessSampler::new(std::process::id());
        let first = sampler.sample().unwrap();
        assert!(first.memory_bytes > 0);
        assert!(first.cpu_percent >= 0.0);
        let second = sampler.sample().unwrap();
        assert!(second.cpu_percent >= 0.0);
    }

    #[test]
    fn test_memory_breach_is_immediate() {
        let config = MonitorConfig {
            memory_limit: ByteSize(1024),
            ..MonitorConfig::default()
        };
        let mut monitor = ResourceMonitor::new(std::process::id(), &config);
        assert!(matches!(
            monitor.check(Instant::now()),
            Some(Breach::Memory { .. })
        ));
    }

    #[test]
    fn test_sampling_missing_process_is_ignored() {
        let mut monitor = ResourceMonitor::new(u32::MAX - 1, &MonitorConfig::default());
        assert_eq!(monitor.check(Instant::now()), None);
    }
}
