//! Hardware address to network address resolution.
//!
//! Cameras keep their hardware address but receive a new network address
//! whenever their DHCP lease changes. Resolution walks every host of one
//! subnet: each host gets a short best-effort probe (which only serves to
//! seed the neighbor table), then the whole neighbor table is read again and
//! searched for the camera. The first match wins.
//!
//! The scan is a pure function of its inputs. There is no process-wide scan
//! state, so it can run again at any time from any feed worker.

use anyhow::{anyhow, Context};
use regex::Regex;
use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::FeedError;
use crate::identity::HardwareAddress;

/// A /24 host range: `base` holds the first three octets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subnet {
    base: [u8; 3],
    first: u8,
    last: u8,
}

impl Subnet {
    pub fn new(base: [u8; 3], first: u8, last: u8) -> crate::Result<Self> {
        if first == 0 || last == 255 || first > last {
            return Err(FeedError::InvalidIdentity(format!(
                "subnet host range {first}..={last} must lie within 1..=254"
            )));
        }
        Ok(Self { base, first, last })
    }

    /// Every candidate host, lowest first.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let [a, b, c] = self.base;
        (self.first..=self.last).map(move |d| Ipv4Addr::new(a, b, c, d))
    }

    pub fn base(&self) -> [u8; 3] {
        self.base
    }

    pub fn first(&self) -> u8 {
        self.first
    }

    pub fn last(&self) -> u8 {
        self.last
    }

    /// Number of hosts a full scan probes.
    pub fn host_count(&self) -> usize {
        (self.last - self.first) as usize + 1
    }
}

impl Default for Subnet {
    fn default() -> Self {
        Self {
            base: [192, 168, 60],
            first: 1,
            last: 254,
        }
    }
}

/// Parses a prefix such as `192.168.60.` (trailing dot optional) into the
/// full 1..=254 range.
impl FromStr for Subnet {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FeedError::InvalidIdentity(format!("malformed subnet prefix '{s}'"));
        let trimmed = s.trim().trim_end_matches('.');
        let octets: Vec<u8> = trimmed
            .split('.')
            .map(|part| part.parse::<u8>().map_err(|_| invalid()))
            .collect::<Result<_, _>>()?;
        let base: [u8; 3] = octets.try_into().map_err(|_| invalid())?;
        Subnet::new(base, 1, 254)
    }
}

/// Sends one reachability probe. Failures are ignored by the scan.
pub trait Prober: Send + Sync {
    fn probe(&self, addr: Ipv4Addr, timeout: Duration);
}

/// Reads the host's neighbor (ARP) table as text.
pub trait NeighborTable: Send + Sync {
    fn read(&self) -> anyhow::Result<String>;
}

/// Probes with the system `ping` binary.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProber;

impl Prober for SystemProber {
    fn probe(&self, addr: Ipv4Addr, timeout: Duration) {
        let mut cmd = Command::new("ping");
        cmd.args(ping_args(timeout, cfg!(windows)))
            .arg(addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Err(err) = cmd.status() {
            log::debug!("probe of {} failed: {}", addr, err);
        }
    }
}

/// Single-echo arguments for `ping`. Windows takes the wait in
/// milliseconds; iputils takes fractional seconds.
fn ping_args(timeout: Duration, windows: bool) -> Vec<String> {
    if windows {
        vec!["-n".into(), "1".into(), "-w".into(), timeout.as_millis().max(1).to_string()]
    } else {
        let secs = timeout.as_secs_f64().max(0.1);
        vec!["-c".into(), "1".into(), "-W".into(), format!("{secs:.1}")]
    }
}

/// Reads the table through `arp -a`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemNeighborTable;

impl NeighborTable for SystemNeighborTable {
    fn read(&self) -> anyhow::Result<String> {
        let output = Command::new("arp")
            .arg("-a")
            .stdin(Stdio::null())
            .output()
            .context("run arp -a")?;
        if !output.status.success() {
            return Err(anyhow!(
                "arp -a exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn dotted_quad() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("static regex is valid")
    })
}

/// Matches a table field against the address. Tables differ in separator,
/// letter case and whether octets are zero padded (`0:1b:...` on BSD).
fn field_matches(field: &str, target: &HardwareAddress) -> bool {
    let field = field.trim_matches(|c: char| !c.is_ascii_hexdigit());
    let parts: Vec<&str> = field.split([':', '-']).collect();
    if parts.len() != 6 {
        return false;
    }
    let octets = target.octets();
    parts.iter().zip(octets.iter()).all(|(part, octet)| {
        (1..=2).contains(&part.len())
            && part.bytes().all(|b| b.is_ascii_hexdigit())
            && u8::from_str_radix(part, 16).ok() == Some(*octet)
    })
}

/// Searches neighbor-table text for the address and returns the first
/// well-formed dotted network address on the first matching line.
pub fn find_in_table(table: &str, target: &HardwareAddress) -> Option<Ipv4Addr> {
    table
        .lines()
        .filter(|line| line.split_whitespace().any(|field| field_matches(field, target)))
        .find_map(|line| {
            dotted_quad()
                .find_iter(line)
                .find_map(|m| m.as_str().parse::<Ipv4Addr>().ok())
        })
}

/// Linear scan over `subnet`. Returns `None` once every host has been
/// probed without a table match, or as soon as `cancel` is raised.
///
/// The table is re-read after every probe so late table updates for earlier
/// hosts are still caught.
pub fn resolve(
    target: &HardwareAddress,
    subnet: &Subnet,
    probe_timeout: Duration,
    prober: &dyn Prober,
    table: &dyn NeighborTable,
    cancel: &AtomicBool,
) -> Option<Ipv4Addr> {
    for host in subnet.hosts() {
        if cancel.load(Ordering::SeqCst) {
            log::debug!("scan for {} cancelled at {}", target, host);
            return None;
        }
        prober.probe(host, probe_timeout);
        match table.read() {
            Ok(text) => {
                if let Some(found) = find_in_table(&text, target) {
                    return Some(found);
                }
            }
            Err(err) => log::debug!("neighbor table unreadable after probing {}: {:#}", host, err),
        }
    }
    None
}

/// Resolution as seen by a stream connection.
pub trait AddressResolver: Send + Sync {
    /// `AddressNotFound` is a normal outcome; callers retry later.
    fn resolve(&self, target: &HardwareAddress, cancel: &AtomicBool) -> crate::Result<Ipv4Addr>;
}

/// Resolver backed by a subnet scan.
pub struct SubnetResolver {
    subnet: Subnet,
    probe_timeout: Duration,
    prober: Box<dyn Prober>,
    table: Box<dyn NeighborTable>,
}

impl SubnetResolver {
    pub fn new(
        subnet: Subnet,
        probe_timeout: Duration,
        prober: Box<dyn Prober>,
        table: Box<dyn NeighborTable>,
    ) -> Self {
        Self {
            subnet,
            probe_timeout,
            prober,
            table,
        }
    }

    /// `ping` probes plus `arp -a`.
    pub fn system(subnet: Subnet, probe_timeout: Duration) -> Self {
        Self::new(
            subnet,
            probe_timeout,
            Box::new(SystemProber),
            Box::new(SystemNeighborTable),
        )
    }

    pub fn subnet(&self) -> &Subnet {
        &self.subnet
    }
}

impl AddressResolver for SubnetResolver {
    fn resolve(&self, target: &HardwareAddress, cancel: &AtomicBool) -> crate::Result<Ipv4Addr> {
        resolve(
            target,
            &self.subnet,
            self.probe_timeout,
            self.prober.as_ref(),
            self.table.as_ref(),
            cancel,
        )
        .ok_or_else(|| FeedError::AddressNotFound(target.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingProber {
        probes: AtomicUsize,
    }

    impl Prober for CountingProber {
        fn probe(&self, _addr: Ipv4Addr, _timeout: Duration) {
            self.probes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct StaticTable(&'static str);

    impl NeighborTable for StaticTable {
        fn read(&self) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    const LINUX_TABLE: &str = "\
? (192.168.60.1) at 00:1a:2b:3c:4d:5e [ether] on eth0
? (192.168.60.42) at aa:bb:cc:dd:ee:ff [ether] on eth0
";

    const WINDOWS_TABLE: &str = "
Interface: 192.168.60.10 --- 0x4
  Internet Address      Physical Address      Type
  192.168.60.1          00-1a-2b-3c-4d-5e     dynamic
  192.168.60.42         aa-bb-cc-dd-ee-ff     dynamic
  192.168.60.255        ff-ff-ff-ff-ff-ff     static
";

    #[test]
    fn finds_address_in_linux_and_windows_tables() -> anyhow::Result<()> {
        let target: HardwareAddress = "AA:BB:CC:DD:EE:FF".parse()?;
        let expected = Ipv4Addr::new(192, 168, 60, 42);
        assert_eq!(find_in_table(LINUX_TABLE, &target), Some(expected));
        assert_eq!(find_in_table(WINDOWS_TABLE, &target), Some(expected));
        Ok(())
    }

    #[test]
    fn interface_header_does_not_match() -> anyhow::Result<()> {
        let target: HardwareAddress = "11:22:33:44:55:66".parse()?;
        assert_eq!(find_in_table(WINDOWS_TABLE, &target), None);
        Ok(())
    }

    #[test]
    fn unpadded_bsd_octets_match() -> anyhow::Result<()> {
        let table = "? (10.0.0.7) at 0:1b:c:d:e:f on en0 ifscope [ethernet]";
        let target: HardwareAddress = "00:1b:0c:0d:0e:0f".parse()?;
        assert_eq!(find_in_table(table, &target), Some(Ipv4Addr::new(10, 0, 0, 7)));
        Ok(())
    }

    #[test]
    fn skips_malformed_dotted_patterns() -> anyhow::Result<()> {
        let table = "999.1.1.1 aa-bb-cc-dd-ee-ff 192.168.60.9";
        let target: HardwareAddress = "aa:bb:cc:dd:ee:ff".parse()?;
        assert_eq!(find_in_table(table, &target), Some(Ipv4Addr::new(192, 168, 60, 9)));
        Ok(())
    }

    #[test]
    fn scan_stops_at_first_match() -> anyhow::Result<()> {
        let prober = CountingProber::default();
        let target: HardwareAddress = "aa:bb:cc:dd:ee:ff".parse()?;
        let found = resolve(
            &target,
            &Subnet::default(),
            Duration::from_millis(1),
            &prober,
            &StaticTable(WINDOWS_TABLE),
            &AtomicBool::new(false),
        );
        assert_eq!(found, Some(Ipv4Addr::new(192, 168, 60, 42)));
        assert_eq!(prober.probes.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn exhausted_scan_reports_not_found() -> anyhow::Result<()> {
        let prober = Arc::new(CountingProber::default());
        let resolver = SubnetResolver::new(
            Subnet::default(),
            Duration::from_millis(1),
            Box::new(ArcProber(prober.clone())),
            Box::new(StaticTable(LINUX_TABLE)),
        );
        let target: HardwareAddress = "de:ad:be:ef:00:01".parse()?;
        let err = resolver
            .resolve(&target, &AtomicBool::new(false))
            .expect_err("address is absent");
        assert!(matches!(err, FeedError::AddressNotFound(_)));
        assert!(err.is_recoverable());
        assert_eq!(prober.probes.load(Ordering::SeqCst), 254);
        Ok(())
    }

    #[test]
    fn raised_cancel_stops_before_probing() -> anyhow::Result<()> {
        let prober = CountingProber::default();
        let target: HardwareAddress = "aa:bb:cc:dd:ee:ff".parse()?;
        let found = resolve(
            &target,
            &Subnet::default(),
            Duration::from_millis(1),
            &prober,
            &StaticTable(LINUX_TABLE),
            &AtomicBool::new(true),
        );
        assert_eq!(found, None);
        assert_eq!(prober.probes.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn subnet_prefix_parses() -> anyhow::Result<()> {
        let subnet: Subnet = "10.1.2.".parse()?;
        assert_eq!(subnet.host_count(), 254);
        assert_eq!(subnet.hosts().next(), Some(Ipv4Addr::new(10, 1, 2, 1)));
        assert_eq!(subnet.hosts().last(), Some(Ipv4Addr::new(10, 1, 2, 254)));
        assert!("10.1".parse::<Subnet>().is_err());
        assert!(Subnet::new([10, 1, 2], 0, 10).is_err());
        Ok(())
    }

    #[test]
    fn ping_wait_keeps_sub_second_timeouts() {
        let args = ping_args(Duration::from_millis(400), false);
        assert_eq!(args, ["-c", "1", "-W", "0.4"]);
        assert_eq!(ping_args(Duration::from_millis(1500), false)[3], "1.5");
        assert_eq!(ping_args(Duration::from_millis(20), false)[3], "0.1");
        assert_eq!(ping_args(Duration::from_millis(400), true), ["-n", "1", "-w", "400"]);
    }

    struct ArcProber(Arc<CountingProber>);

    impl Prober for ArcProber {
        fn probe(&self, addr: Ipv4Addr, timeout: Duration) {
            self.0.probe(addr, timeout)
        }
    }
}
