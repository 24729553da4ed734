//! Console and UDP port bookkeeping.
//!
//! Ports are scoped per (host, class). Each scope has its own lock so
//! reservations on different computes or classes never contend.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    error::{ControllerError, Result},
    settings::ServerSettings,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortClass {
    Console,
    Vnc,
    Udp,
}

impl PortClass {
    pub const ALL: [PortClass; 3] = [PortClass::Console, PortClass::Vnc, PortClass::Udp];

    pub fn as_str(self) -> &'static str {
        match self {
            PortClass::Console => "console",
            PortClass::Vnc => "vnc",
            PortClass::Udp => "udp",
        }
    }
}

impl fmt::Display for PortClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if end <= start {
            return Err(ControllerError::InvalidConfiguration(format!(
                "invalid port range [{start}, {end}): end must be greater than start"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end
    }

    fn lowest_free(&self, taken: &BTreeSet<u16>) -> Option<u16> {
        let mut candidate = u32::from(self.start);
        for port in taken.range(self.start..self.end) {
            if u32::from(*port) != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate < u32::from(self.end) {
            u16::try_from(candidate).ok()
        } else {
            None
        }
    }
}

type Scope = Arc<Mutex<BTreeSet<u16>>>;

pub struct PortAllocator {
    ranges: HashMap<PortClass, PortRange>,
    scopes: Mutex<HashMap<(String, PortClass), Scope>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            ranges: HashMap::new(),
            scopes: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &ServerSettings) -> Result<Self> {
        let mut allocator = Self::new();
        allocator.configure(
            PortClass::Console,
            settings.console_start_port_range,
            settings.console_end_port_range,
        )?;
        allocator.configure(
            PortClass::Vnc,
            settings.vnc_console_start_port_range,
            settings.vnc_console_end_port_range,
        )?;
        allocator.configure(
            PortClass::Udp,
            settings.udp_start_port_range,
            settings.udp_end_port_range,
        )?;
        Ok(allocator)
    }

    /// Sets the range for `class`. Taking `&mut self` means ranges can only
    /// change before the allocator is shared.
    pub fn configure(&mut self, class: PortClass, start: u16, end: u16) -> Result<()> {
        let range = PortRange::new(start, end).map_err(|_| {
            ControllerError::InvalidConfiguration(format!(
                "invalid {class} port range: end {end} must be greater than start {start}"
            ))
        })?;
        self.ranges.insert(class, range);
        Ok(())
    }

    pub fn range(&self, class: PortClass) -> Option<PortRange> {
        self.ranges.get(&class).copied()
    }

    /// Reserves a port on `host`. A free in-range `preferred` port is taken
    /// as is; anything else gets the lowest free port of the range.
    pub fn reserve(&self, host: &str, class: PortClass, preferred: Option<u16>) -> Result<u16> {
        let range = self.range(class).ok_or_else(|| {
            ControllerError::InvalidConfiguration(format!("no {class} port range configured"))
        })?;
        let scope = self.scope(host, class);
        let mut taken = scope.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(port) = preferred {
            if range.contains(port) && !taken.contains(&port) {
                taken.insert(port);
                debug!("reserved preferred {class} port {port} on {host}");
                return Ok(port);
            }
            warn!(
                "{class} port {port} on {host} is not available, allocating from [{}, {})",
                range.start(),
                range.end()
            );
        }

        let port = range
            .lowest_free(&taken)
            .ok_or_else(|| ControllerError::ResourceExhausted {
                host: host.to_string(),
                class: class.to_string(),
            })?;
        taken.insert(port);
        debug!("reserved {class} port {port} on {host}");
        Ok(port)
    }

    pub fn reserve_guarded(
        self: &Arc<Self>,
        host: &str,
        class: PortClass,
        preferred: Option<u16>,
    ) -> Result<PortReservation> {
        let port = self.reserve(host, class, preferred)?;
        Ok(self.adopt(host, class, port))
    }

    /// Wraps a port that is already reserved so it is released when the
    /// returned guard drops.
    pub fn adopt(self: &Arc<Self>, host: &str, class: PortClass, port: u16) -> PortReservation {
        PortReservation {
            allocator: Arc::clone(self),
            host: host.to_string(),
            class,
            port,
            armed: true,
        }
    }

    /// Releasing a port that is not reserved does nothing.
    pub fn release(&self, host: &str, class: PortClass, port: u16) {
        let scope = self.scope(host, class);
        let mut taken = scope.lock().unwrap_or_else(PoisonError::into_inner);
        if taken.remove(&port) {
            debug!("released {class} port {port} on {host}");
        }
    }

    pub fn reserved(&self, host: &str, class: PortClass) -> Vec<u16> {
        let scope = self.scope(host, class);
        let taken = scope.lock().unwrap_or_else(PoisonError::into_inner);
        taken.iter().copied().collect()
    }

    /// Reserved ports of `class` summed over every host.
    pub fn reserved_total(&self, class: PortClass) -> usize {
        let scopes = self
            .scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((_, scope_class), _)| *scope_class == class)
            .map(|(_, scope)| Arc::clone(scope))
            .collect::<Vec<_>>();
        scopes
            .iter()
            .map(|scope| scope.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    fn scope(&self, host: &str, class: PortClass) -> Scope {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            scopes
                .entry((host.to_string(), class))
                .or_insert_with(|| Arc::new(Mutex::new(BTreeSet::new()))),
        )
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A reserved port that goes back to the allocator when dropped, unless
/// [`PortReservation::commit`] was called.
pub struct PortReservation {
    allocator: Arc<PortAllocator>,
    host: String,
    class: PortClass,
    port: u16,
    armed: bool,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn class(&self) -> PortClass {
        self.class
    }

    pub fn commit(mut self) -> u16 {
        self.armed = false;
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if self.armed {
            self.allocator.release(&self.host, self.class, self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn allocator(start: u16, end: u16) -> Arc<PortAllocator> {
        let mut allocator = PortAllocator::new();
        allocator
            .configure(PortClass::Console, start, end)
            .expect("range should be valid");
        Arc::new(allocator)
    }

    #[test]
    fn configure_rejects_empty_or_inverted_range() {
        let mut allocator = PortAllocator::new();
        for (start, end) in [(5000, 5000), (6000, 5000)] {
            let err = allocator
                .configure(PortClass::Udp, start, end)
                .expect_err("range must be rejected");
            assert!(matches!(err, ControllerError::InvalidConfiguration(_)));
        }
        assert!(allocator.range(PortClass::Udp).is_none());
    }

    #[test]
    fn lowest_free_port_fills_gaps() {
        let allocator = allocator(5000, 5010);
        assert_eq!(allocator.reserve("h", PortClass::Console, None).ok(), Some(5000));
        assert_eq!(allocator.reserve("h", PortClass::Console, None).ok(), Some(5001));
        assert_eq!(allocator.reserve("h", PortClass::Console, None).ok(), Some(5002));
        allocator.release("h", PortClass::Console, 5001);
        assert_eq!(allocator.reserve("h", PortClass::Console, None).ok(), Some(5001));
        assert_eq!(allocator.reserve("h", PortClass::Console, None).ok(), Some(5003));
    }

    #[test]
    fn range_upper_bound_is_exclusive() {
        let allocator = allocator(65533, 65535);
        assert_eq!(allocator.reserve("h", PortClass::Console, None).ok(), Some(65533));
        assert_eq!(allocator.reserve("h", PortClass::Console, None).ok(), Some(65534));
        let err = allocator
            .reserve("h", PortClass::Console, None)
            .expect_err("range should be exhausted");
        assert!(matches!(err, ControllerError::ResourceExhausted { .. }));
    }

    #[test]
    fn hosts_and_classes_are_separate_scopes() {
        let mut allocator = PortAllocator::new();
        allocator
            .configure(PortClass::Console, 5000, 5001)
            .expect("console range");
        allocator
            .configure(PortClass::Vnc, 5900, 5901)
            .expect("vnc range");
        assert_eq!(allocator.reserve("a", PortClass::Console, None).ok(), Some(5000));
        assert_eq!(allocator.reserve("b", PortClass::Console, None).ok(), Some(5000));
        assert_eq!(allocator.reserve("a", PortClass::Vnc, None).ok(), Some(5900));
        assert!(allocator.reserve("a", PortClass::Console, None).is_err());
        assert_eq!(allocator.reserved_total(PortClass::Console), 2);
    }

    #[test]
    fn concurrent_reservations_are_distinct_until_exhausted() {
        let allocator = allocator(6000, 6032);
        let handles = (0..32)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || allocator.reserve("h", PortClass::Console, None))
            })
            .collect::<Vec<_>>();
        let ports = handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .expect("thread should finish")
                    .expect("capacity covers every reservation")
            })
            .collect::<HashSet<_>>();
        assert_eq!(ports.len(), 32);
        assert!(ports.iter().all(|port| (6000..6032).contains(port)));

        let err = allocator
            .reserve("h", PortClass::Console, None)
            .expect_err("one more than capacity");
        assert!(matches!(
            err,
            ControllerError::ResourceExhausted { ref host, ref class } if host == "h" && class == "console"
        ));
    }

    #[test]
    fn releasing_unreserved_port_is_a_no_op() {
        let allocator = allocator(5000, 5002);
        allocator.release("h", PortClass::Console, 5001);
        let port = allocator
            .reserve("h", PortClass::Console, None)
            .expect("reserve");
        allocator.release("h", PortClass::Console, port);
        allocator.release("h", PortClass::Console, port);
        assert!(allocator.reserved("h", PortClass::Console).is_empty());
    }

    #[test]
    fn preferred_port_is_honoured_when_free() {
        let allocator = allocator(5000, 5010);
        assert_eq!(
            allocator.reserve("h", PortClass::Console, Some(5007)).ok(),
            Some(5007)
        );
        // busy and out-of-range preferences both fall back to the lowest free port
        assert_eq!(
            allocator.reserve("h", PortClass::Console, Some(5007)).ok(),
            Some(5000)
        );
        assert_eq!(
            allocator.reserve("h", PortClass::Console, Some(80)).ok(),
            Some(5001)
        );
    }

    #[test]
    fn dropped_reservation_releases_and_commit_keeps() {
        let allocator = allocator(5000, 5010);
        {
            let reservation = allocator
                .reserve_guarded("h", PortClass::Console, None)
                .expect("reserve");
            assert_eq!(reservation.port(), 5000);
            assert_eq!(allocator.reserved("h", PortClass::Console), vec![5000]);
        }
        assert!(allocator.reserved("h", PortClass::Console).is_empty());

        let kept = allocator
            .reserve_guarded("h", PortClass::Console, None)
            .expect("reserve")
            .commit();
        assert_eq!(kept, 5000);
        assert_eq!(allocator.reserved("h", PortClass::Console), vec![5000]);
    }

    #[test]
    fn unconfigured_class_is_a_configuration_error() {
        let allocator = allocator(5000, 5010);
        let err = allocator
            .reserve("h", PortClass::Udp, None)
            .expect_err("udp has no range");
        assert!(matches!(err, ControllerError::InvalidConfiguration(_)));
    }
}
