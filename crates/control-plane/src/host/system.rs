//! Host totals for dashboards, read from `/proc` either directly or through
//! a shell on the tenant's host. Both readers share the parsers below so
//! their snapshots have the same shape.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use sysinfo::{Disks, System};

use super::{Host, HostError, SHORT_COMMAND_TIMEOUT};

const CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CpuStats {
    pub cores: usize,
    pub usage_percent: f64,
    pub load_average: [f64; 3],
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiskStats {
    pub mount_point: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    pub interface: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub uptime_seconds: u64,
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub disks: Vec<DiskStats>,
    pub network: Vec<NetworkStats>,
}

#[async_trait]
pub trait SystemReader: Send + Sync {
    async fn snapshot(&self) -> Result<SystemSnapshot, HostError>;
}

/// Reads this machine's `/proc` directly.
#[derive(Clone, Debug, Default)]
pub struct LocalSystemReader;

#[async_trait]
impl SystemReader for LocalSystemReader {
    async fn snapshot(&self) -> Result<SystemSnapshot, HostError> {
        let first_sample = read_proc("/proc/stat").await?;
        tokio::time::sleep(CPU_SAMPLE_INTERVAL).await;
        let second_sample = read_proc("/proc/stat").await?;
        let meminfo = read_proc("/proc/meminfo").await?;
        let loadavg = read_proc("/proc/loadavg").await?;
        let uptime = read_proc("/proc/uptime").await?;
        let netdev = read_proc("/proc/net/dev").await?;

        let disks = Disks::new_with_refreshed_list();
        let mut disk_stats: Vec<DiskStats> = disks
            .list()
            .iter()
            .map(|disk| DiskStats {
                mount_point: disk.mount_point().display().to_string(),
                total_bytes: disk.total_space(),
                used_bytes: disk.total_space().saturating_sub(disk.available_space()),
            })
            .collect();
        disk_stats.sort_by(|left, right| left.mount_point.cmp(&right.mount_point));

        Ok(SystemSnapshot {
            hostname: System::host_name().unwrap_or_default(),
            os: System::long_os_version().unwrap_or_default(),
            kernel: System::kernel_version().unwrap_or_default(),
            uptime_seconds: parse_uptime(&uptime),
            cpu: CpuStats {
                cores: count_cpu_lines(&second_sample),
                usage_percent: cpu_usage_between(&first_sample, &second_sample),
                load_average: parse_loadavg(&loadavg),
            },
            memory: parse_meminfo(&meminfo),
            disks: disk_stats,
            network: parse_net_dev(&netdev),
        })
    }
}

async fn read_proc(path: &str) -> Result<String, HostError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|error| HostError::File(format!("{path}: {error}")))
}

const REMOTE_PROBE: &str = "echo '==hostname=='; hostname; \
echo '==os=='; (. /etc/os-release 2>/dev/null && echo \"$PRETTY_NAME\") || uname -s; \
echo '==kernel=='; uname -r; \
echo '==uptime=='; cat /proc/uptime; \
echo '==loadavg=='; cat /proc/loadavg; \
echo '==stat1=='; cat /proc/stat; sleep 0.2; \
echo '==stat2=='; cat /proc/stat; \
echo '==meminfo=='; cat /proc/meminfo; \
echo '==df=='; df -kP; \
echo '==netdev=='; cat /proc/net/dev";

/// Reads `/proc` on a host through one shell round trip.
pub struct RemoteSystemReader {
    host: Arc<dyn Host>,
}

impl RemoteSystemReader {
    #[must_use]
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl SystemReader for RemoteSystemReader {
    async fn snapshot(&self) -> Result<SystemSnapshot, HostError> {
        let output = self.host.execute(REMOTE_PROBE, SHORT_COMMAND_TIMEOUT).await?;
        if output.stdout.trim().is_empty() {
            return Err(HostError::Transient(format!(
                "system probe returned nothing: {}",
                output.stderr.trim()
            )));
        }
        Ok(parse_probe_output(&output.stdout))
    }
}

#[must_use]
pub fn parse_probe_output(raw: &str) -> SystemSnapshot {
    let sections = split_sections(raw);
    let section = |name: &str| sections.get(name).map_or("", String::as_str);

    SystemSnapshot {
        hostname: section("hostname").trim().to_string(),
        os: section("os").trim().to_string(),
        kernel: section("kernel").trim().to_string(),
        uptime_seconds: parse_uptime(section("uptime")),
        cpu: CpuStats {
            cores: count_cpu_lines(section("stat2")),
            usage_percent: cpu_usage_between(section("stat1"), section("stat2")),
            load_average: parse_loadavg(section("loadavg")),
        },
        memory: parse_meminfo(section("meminfo")),
        disks: parse_df(section("df")),
        network: parse_net_dev(section("netdev")),
    }
}

fn split_sections(raw: &str) -> BTreeMap<String, String> {
    let mut sections = BTreeMap::new();
    let mut current: Option<String> = None;
    for line in raw.lines() {
        if let Some(name) = line.strip_prefix("==").and_then(|rest| rest.strip_suffix("==")) {
            current = Some(name.to_string());
            sections.entry(name.to_string()).or_insert_with(String::new);
            continue;
        }
        if let Some(name) = &current {
            if let Some(body) = sections.get_mut(name) {
                body.push_str(line);
                body.push('\n');
            }
        }
    }
    sections
}

fn parse_uptime(raw: &str) -> u64 {
    // "3600.52 7000.00": whole seconds of the first field.
    raw.split_whitespace()
        .next()
        .and_then(|value| value.split('.').next())
        .and_then(|seconds| seconds.parse::<u64>().ok())
        .unwrap_or(0)
}

fn parse_loadavg(raw: &str) -> [f64; 3] {
    let mut values = raw
        .split_whitespace()
        .take(3)
        .map(|value| value.parse::<f64>().unwrap_or(0.0));
    [
        values.next().unwrap_or(0.0),
        values.next().unwrap_or(0.0),
        values.next().unwrap_or(0.0),
    ]
}

fn count_cpu_lines(stat: &str) -> usize {
    stat.lines()
        .filter(|line| {
            line.strip_prefix("cpu")
                .and_then(|rest| rest.chars().next())
                .is_some_and(|character| character.is_ascii_digit())
        })
        .count()
}

/// `(busy, total)` jiffies from the aggregate `cpu` line.
fn cpu_times(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|value| value.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some((total.saturating_sub(idle), total))
}

#[allow(clippy::cast_precision_loss)]
fn cpu_usage_between(first: &str, second: &str) -> f64 {
    let (Some((busy_before, total_before)), Some((busy_after, total_after))) =
        (cpu_times(first), cpu_times(second))
    else {
        return 0.0;
    };
    let total = total_after.saturating_sub(total_before);
    if total == 0 {
        return 0.0;
    }
    let busy = busy_after.saturating_sub(busy_before);
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

fn parse_meminfo(raw: &str) -> MemoryStats {
    let mut fields = BTreeMap::new();
    for line in raw.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let kilobytes = rest
            .split_whitespace()
            .next()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        fields.insert(key.trim().to_string(), kilobytes.saturating_mul(1024));
    }

    let total_bytes = fields.get("MemTotal").copied().unwrap_or(0);
    let available_bytes = fields
        .get("MemAvailable")
        .or_else(|| fields.get("MemFree"))
        .copied()
        .unwrap_or(0);
    MemoryStats {
        total_bytes,
        available_bytes,
        used_bytes: total_bytes.saturating_sub(available_bytes),
    }
}

fn parse_df(raw: &str) -> Vec<DiskStats> {
    let mut disks: Vec<DiskStats> = raw
        .lines()
        .skip(1)
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 6 || !columns[0].starts_with('/') {
                return None;
            }
            let total_kb = columns[1].parse::<u64>().ok()?;
            let used_kb = columns[2].parse::<u64>().ok()?;
            Some(DiskStats {
                mount_point: columns[5..].join(" "),
                total_bytes: total_kb.saturating_mul(1024),
                used_bytes: used_kb.saturating_mul(1024),
            })
        })
        .collect();
    disks.sort_by(|left, right| left.mount_point.cmp(&right.mount_point));
    disks
}

fn parse_net_dev(raw: &str) -> Vec<NetworkStats> {
    raw.lines()
        .filter_map(|line| {
            let (interface, counters) = line.split_once(':')?;
            let interface = interface.trim();
            if interface.is_empty() || interface == "lo" || interface.contains('|') {
                return None;
            }
            let values: Vec<u64> = counters
                .split_whitespace()
                .filter_map(|value| value.parse().ok())
                .collect();
            if values.len() < 9 {
                return None;
            }
            Some(NetworkStats {
                interface: interface.to_string(),
                rx_bytes: values[0],
                tx_bytes: values[8],
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_BEFORE: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\ncpu1 50 0 50 350 50 0 0 0 0 0\nintr 1\n";
    const STAT_AFTER: &str = "cpu  150 0 150 750 150 0 0 0 0 0\ncpu0 75 0 75 375 75 0 0 0 0 0\ncpu1 75 0 75 375 75 0 0 0 0 0\nintr 2\n";

    #[test]
    fn cpu_usage_is_busy_share_of_elapsed_jiffies() {
        // 200 elapsed jiffies, 100 of them idle or iowait.
        assert!((cpu_usage_between(STAT_BEFORE, STAT_AFTER) - 50.0).abs() < f64::EPSILON);
        assert_eq!(count_cpu_lines(STAT_AFTER), 2);
        assert!(cpu_usage_between("", STAT_AFTER).abs() < f64::EPSILON);
    }

    #[test]
    fn meminfo_prefers_available_over_free() {
        let memory = parse_meminfo("MemTotal:        2048 kB\nMemFree:          512 kB\nMemAvailable:    1024 kB\n");
        assert_eq!(memory.total_bytes, 2048 * 1024);
        assert_eq!(memory.available_bytes, 1024 * 1024);
        assert_eq!(memory.used_bytes, 1024 * 1024);
    }

    #[test]
    fn df_skips_pseudo_filesystems() {
        let raw = "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
/dev/sda1 1000 400 600 40% /\n\
tmpfs 100 0 100 0% /run\n\
/dev/sdb1 2000 1000 1000 50% /mnt/data volume\n";
        let disks = parse_df(raw);
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].mount_point, "/");
        assert_eq!(disks[0].used_bytes, 400 * 1024);
        assert_eq!(disks[1].mount_point, "/mnt/data volume");
    }

    #[test]
    fn net_dev_reads_rx_and_tx_and_skips_loopback() {
        let raw = "Inter-|   Receive                                                |  Transmit\n \
face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    \
lo: 500 5 0 0 0 0 0 0 500 5 0 0 0 0 0 0\n  \
eth0: 9000 90 0 0 0 0 0 0 3000 30 0 0 0 0 0 0\n";
        let network = parse_net_dev(raw);
        assert_eq!(
            network,
            vec![NetworkStats {
                interface: "eth0".to_string(),
                rx_bytes: 9000,
                tx_bytes: 3000,
            }]
        );
    }

    #[test]
    fn probe_output_becomes_a_snapshot() {
        let raw = format!(
            "==hostname==\nbox-1\n==os==\nUbuntu 24.04 LTS\n==kernel==\n6.8.0\n==uptime==\n3600.52 7000.00\n\
==loadavg==\n0.50 0.25 0.10 1/200 999\n==stat1==\n{STAT_BEFORE}==stat2==\n{STAT_AFTER}\
==meminfo==\nMemTotal: 4096 kB\nMemAvailable: 1024 kB\n==df==\nFilesystem 1024-blocks Used Available Capacity Mounted on\n/dev/vda1 100 50 50 50% /\n\
==netdev==\n eth0: 10 1 0 0 0 0 0 0 20 2 0 0 0 0 0 0\n"
        );
        let snapshot = parse_probe_output(&raw);
        assert_eq!(snapshot.hostname, "box-1");
        assert_eq!(snapshot.os, "Ubuntu 24.04 LTS");
        assert_eq!(snapshot.uptime_seconds, 3600);
        assert_eq!(snapshot.cpu.cores, 2);
        assert!((snapshot.cpu.load_average[0] - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.memory.used_bytes, 3072 * 1024);
        assert_eq!(snapshot.disks.len(), 1);
        assert_eq!(snapshot.network[0].tx_bytes, 20);
    }
}
