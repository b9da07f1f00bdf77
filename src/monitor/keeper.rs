//! Control loop
//!
//! One task owns all state. Each tick runs wake/sleep detection, checks
//! every monitored interface, and performs at most one gadget reset for all
//! interfaces that asked for one. The only suspension points are the probes,
//! the lifecycle calls and the end-of-tick sleep.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::interface::InterfaceState;
use crate::config::KeeperConfig;
use crate::error::AppError;
use crate::gadget::GadgetControl;
use crate::link::{LinkObserver, PowerEvent, PowerOutcome, PowerState, UsbState};
use crate::net::{ConnectivityProber, Reachability};
use crate::persist::{LinkStatus, StatusStore};
use crate::policy::{FailureKind, ResetPolicy, TRACE_TARGET};
use crate::utils::LogThrottler;

const SETUP_FAILED_KEY: &str = "gadget-setup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No gadget bound; setup is retried periodically
    NotBound,
    Normal,
}

pub struct Keeper {
    config: KeeperConfig,
    observer: Box<dyn LinkObserver>,
    prober: ConnectivityProber,
    gadget: Box<dyn GadgetControl>,
    store: StatusStore,
    policy: ResetPolicy,
    power: PowerState,
    links: BTreeMap<String, InterfaceState>,
    mode: Mode,
    throttler: LogThrottler,
}

impl Keeper {
    pub fn new(
        config: KeeperConfig,
        observer: Box<dyn LinkObserver>,
        prober: ConnectivityProber,
        gadget: Box<dyn GadgetControl>,
        mut store: StatusStore,
    ) -> Self {
        if let Err(e) = store.ensure(&config.monitor.interfaces) {
            warn!("Failed to initialize link state file: {}", e);
        }

        let links = config
            .monitor
            .interfaces
            .iter()
            .map(|name| (name.clone(), InterfaceState::new(name, store.get(name))))
            .collect();

        Self {
            policy: ResetPolicy::new(config.policy.clone()),
            config,
            observer,
            prober,
            gadget,
            store,
            power: PowerState::new(),
            links,
            mode: Mode::NotBound,
            throttler: LogThrottler::default(),
        }
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Cancellation interrupts the end-of-tick sleep; a tick in progress
    /// runs to completion.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            "Monitoring {} (state file {})",
            self.config.monitor.interfaces.join(", "),
            self.store.path().display()
        );

        loop {
            let delay = self.tick(Instant::now()).await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Link monitor stopped");
    }

    /// One loop iteration; returns the delay before the next one
    pub async fn tick(&mut self, now: Instant) -> Duration {
        match self.mode {
            Mode::NotBound => self.try_setup(now).await,
            Mode::Normal => self.monitor_tick(now).await,
        }
    }

    async fn try_setup(&mut self, now: Instant) -> Duration {
        match self.gadget.initial_setup().await {
            Ok(()) => {
                self.throttler.clear(SETUP_FAILED_KEY);
                let suspend = self.observer.suspend_flag();
                let dsts = self.observer.debug_suspend_bit();
                self.power.baseline(suspend, dsts);
                if self.power.host_is_sleeping {
                    info!(
                        "Host appears to be asleep (suspended={}, dsts={})",
                        suspend, dsts
                    );
                }
                self.mode = Mode::Normal;
                self.config.monitor.short_interval()
            }
            Err(e) => {
                if self.throttler.should_log(SETUP_FAILED_KEY, now) {
                    log_lifecycle_error("Gadget setup failed", &e);
                } else {
                    debug!("Gadget setup failed: {}", e);
                }
                self.config.monitor.not_bound_retry()
            }
        }
    }

    async fn monitor_tick(&mut self, now: Instant) -> Duration {
        self.handle_power_event(now).await;

        let mut requested = Vec::new();
        let names: Vec<String> = self.links.keys().cloned().collect();
        for name in names {
            let Some(mut link) = self.links.remove(&name) else {
                continue;
            };
            let wants_reset = self.check_interface(&mut link, now).await;
            self.links.insert(name.clone(), link);
            if wants_reset {
                requested.push(name);
            }
        }

        if !requested.is_empty() {
            if self.power.host_is_sleeping {
                info!(
                    "Reset requested by {} deferred: host is asleep",
                    requested.join(", ")
                );
            } else {
                self.perform_reset(now, &requested).await;
            }
        }

        self.next_interval(now)
    }

    /// Feed the power signals to the detector and apply the outcome
    pub async fn handle_power_event(&mut self, now: Instant) {
        let suspend = self.observer.suspend_flag();
        let dsts = self.observer.debug_suspend_bit();
        let (event, outcome) = self.power.apply(suspend, dsts, now);

        if event != PowerEvent::None {
            debug!(
                target: TRACE_TARGET,
                event = ?event,
                outcome = ?outcome,
                suspended = %suspend,
                dsts = %dsts,
                "power event"
            );
        }

        match outcome {
            PowerOutcome::Woke => {
                info!("Host woke up (suspended={}, dsts={})", suspend, dsts);
                for link in self.links.values_mut() {
                    link.reset_counters();
                    link.is_idle = false;
                    link.is_connected = false;
                }
                for name in self.links.keys() {
                    self.prober.refresh_neighbor_table(name).await;
                }
            }
            PowerOutcome::Slept => {
                info!("Host went to sleep (suspended={}, dsts={})", suspend, dsts);
                for link in self.links.values_mut() {
                    link.reset_counters();
                }
            }
            PowerOutcome::Unchanged => {}
        }
    }

    /// Check one interface; true when it asks for a reset
    async fn check_interface(&mut self, link: &mut InterfaceState, now: Instant) -> bool {
        let usb_state = self.observer.usb_state();
        if usb_state == UsbState::Unknown {
            if self.throttler.should_log(&link.name, now) {
                warn!("{}: USB state unreadable, skipping check", link.name);
            }
            return false;
        }
        self.throttler.clear(&link.name);

        if usb_state != link.usb_state {
            if link.usb_state != UsbState::Unknown {
                info!("{}: USB {} -> {}", link.name, link.usb_state, usb_state);
                // Losing the attachment keeps the evidence gathered so far
                if usb_state != UsbState::NotAttached {
                    link.reset_counters();
                }
            }
            link.usb_state = usb_state;
        }

        match usb_state {
            UsbState::NotAttached => {
                link.counters.not_attached += 1;
                link.suspended_logged = false;
                if !link.link_down_logged {
                    info!("{}: USB not attached", link.name);
                    link.link_down_logged = true;
                }
                link.is_connected = false;
                self.set_status(link, LinkStatus::Disconnected, None);
                self.evaluate(link, FailureKind::NotAttached, now)
            }
            UsbState::Suspended => {
                link.link_down_logged = false;
                if !link.suspended_logged {
                    info!("{}: USB bus suspended", link.name);
                    link.suspended_logged = true;
                }
                false
            }
            UsbState::Configured => {
                link.suspended_logged = false;
                link.link_down_logged = false;
                self.check_connectivity(link, now).await
            }
            UsbState::Unknown => false,
        }
    }

    async fn check_connectivity(&mut self, link: &mut InterfaceState, now: Instant) -> bool {
        let Some(addr) = self
            .prober
            .get_host_address(&link.name, link.last_host_ip)
            .await
        else {
            link.counters.fail_no_ip += 1;
            if link.is_connected {
                warn!("{}: host address lost", link.name);
                link.is_connected = false;
            }
            debug!(
                "{}: no host address ({} consecutive)",
                link.name, link.counters.fail_no_ip
            );
            self.set_status(link, LinkStatus::Waiting, None);
            return self.evaluate(link, FailureKind::NoIp, now);
        };

        link.last_host_ip = Some(addr);
        let reachability = self
            .prober
            .verify_reachability(&link.name, addr, link.usb_state, &mut link.is_idle)
            .await;

        match reachability {
            Reachability::Reachable => {
                link.counters.fail_no_ip = 0;
                link.counters.fail_no_ping = 0;
                if !link.is_connected {
                    info!("{}: connected to host {}", link.name, addr);
                    link.is_connected = true;
                }
                self.set_status(link, LinkStatus::Connected, Some(addr));
                false
            }
            Reachability::Unreachable => {
                link.counters.fail_no_ping += 1;
                if link.is_connected {
                    warn!("{}: host {} stopped responding", link.name, addr);
                    link.is_connected = false;
                }
                debug!(
                    "{}: host {} unreachable ({} consecutive)",
                    link.name, addr, link.counters.fail_no_ping
                );
                self.set_status(link, LinkStatus::Waiting, Some(addr));
                self.evaluate(link, FailureKind::NoPing, now)
            }
        }
    }

    fn evaluate(&self, link: &InterfaceState, kind: FailureKind, now: Instant) -> bool {
        let snapshot = link.snapshot(self.store.connected_once(&link.name));
        self.policy
            .should_reset(&snapshot, kind, self.power.wake_detected_at, now)
    }

    fn set_status(
        &mut self,
        link: &mut InterfaceState,
        status: LinkStatus,
        host_ip: Option<Ipv4Addr>,
    ) {
        link.connection = status;
        match self.store.update(&link.name, status, host_ip) {
            Ok(true) => debug!("{}: status {}", link.name, status),
            Ok(false) => {}
            Err(e) => {
                if self.throttler.should_log("state-file", Instant::now()) {
                    warn!("Failed to persist link state: {}", e);
                }
            }
        }
    }

    async fn perform_reset(&mut self, now: Instant, requested: &[String]) {
        warn!("Resetting USB gadget (requested by {})", requested.join(", "));
        let started = Instant::now();

        match self.gadget.reset().await {
            Ok(()) => {
                for link in self.links.values_mut() {
                    link.clear_after_reset();
                }
                let suspend = self.observer.suspend_flag();
                let dsts = self.observer.debug_suspend_bit();
                self.power.rearm(suspend, dsts, now + started.elapsed());
                info!("USB gadget reset took {:?}", started.elapsed());
            }
            Err(e) => {
                log_lifecycle_error("USB gadget reset failed", &e);
                self.mode = Mode::NotBound;
            }
        }
    }

    /// Delay before the next tick
    pub fn next_interval(&self, now: Instant) -> Duration {
        let monitor = &self.config.monitor;

        if self.mode == Mode::NotBound {
            return monitor.not_bound_retry();
        }
        if self.links.values().any(|l| l.usb_state == UsbState::Suspended) {
            return monitor.suspended_interval();
        }
        if self
            .links
            .values()
            .all(|l| l.connection == LinkStatus::Connected)
        {
            return if self
                .power
                .in_turbo_window(now, self.policy.config().turbo_window())
            {
                monitor.fast_interval()
            } else {
                monitor.normal_interval()
            };
        }
        monitor.short_interval()
    }
}

fn log_lifecycle_error(context: &str, e: &AppError) {
    if e.is_transient() {
        warn!("{}: {}", context, e);
    } else {
        error!("{}: {}", context, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;
    use crate::error::Result;
    use crate::link::Signal;
    use crate::net::neighbor::NeighborState;
    use crate::net::prober::tests::{FakeNet, HOST};
    use crate::policy::Counters;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::{tempdir, TempDir};

    #[derive(Debug, Clone, Copy)]
    struct Observed {
        usb: UsbState,
        suspend: Signal,
        dsts: Signal,
    }

    #[derive(Clone)]
    struct FakeObserver(Arc<Mutex<Observed>>);

    impl LinkObserver for FakeObserver {
        fn usb_state(&self) -> UsbState {
            self.0.lock().unwrap().usb
        }

        fn suspend_flag(&self) -> Signal {
            self.0.lock().unwrap().suspend
        }

        fn debug_suspend_bit(&self) -> Signal {
            self.0.lock().unwrap().dsts
        }
    }

    #[derive(Clone, Default)]
    struct FakeGadget {
        resets: Arc<AtomicU32>,
        setups: Arc<AtomicU32>,
        fail_reset: Arc<AtomicBool>,
    }

    #[async_trait]
    impl GadgetControl for FakeGadget {
        async fn reset(&mut self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if self.fail_reset.load(Ordering::SeqCst) {
                return Err(AppError::ControllerUnavailable { attempts: 2 });
            }
            Ok(())
        }

        async fn initial_setup(&mut self) -> Result<()> {
            self.setups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        _dir: TempDir,
        observed: Arc<Mutex<Observed>>,
        net: Arc<FakeNet>,
        gadget: FakeGadget,
        keeper: Keeper,
        base: Instant,
    }

    impl Harness {
        /// `state_line` pre-seeds the state file
        fn new(state_line: Option<&str>) -> Self {
            Self::with_interfaces(state_line, &["usb0"])
        }

        fn with_interfaces(state_line: Option<&str>, interfaces: &[&str]) -> Self {
            let dir = tempdir().unwrap();
            let state_file = dir.path().join("link-status");
            if let Some(line) = state_line {
                std::fs::write(&state_file, format!("{}\n", line)).unwrap();
            }

            let observed = Arc::new(Mutex::new(Observed {
                usb: UsbState::Configured,
                suspend: Signal::Clear,
                dsts: Signal::Clear,
            }));
            let net = Arc::new(FakeNet::default());
            let gadget = FakeGadget::default();

            let mut config = KeeperConfig::default();
            config.monitor.interfaces = interfaces.iter().map(|s| s.to_string()).collect();
            config.store.state_file = state_file.clone();
            let probe = ProbeConfig {
                discovery_wait_ms: 0,
                ..Default::default()
            };
            let prober = ConnectivityProber::new(net.clone(), probe);

            let keeper = Keeper::new(
                config,
                Box::new(FakeObserver(observed.clone())),
                prober,
                Box::new(gadget.clone()),
                StatusStore::open(&state_file),
            );

            Self {
                _dir: dir,
                observed,
                net,
                gadget,
                keeper,
                base: Instant::now(),
            }
        }

        fn set_usb(&self, usb: UsbState) {
            self.observed.lock().unwrap().usb = usb;
        }

        fn set_signals(&self, suspend: Signal, dsts: Signal) {
            let mut observed = self.observed.lock().unwrap();
            observed.suspend = suspend;
            observed.dsts = dsts;
        }

        /// Tick at `secs` seconds after the harness was created
        async fn tick_at(&mut self, secs: u64) -> Duration {
            let now = self.base + Duration::from_secs(secs);
            self.keeper.tick(now).await
        }

        async fn start(&mut self) {
            self.tick_at(0).await;
            assert_eq!(self.keeper.mode, Mode::Normal);
        }

        fn resets(&self) -> u32 {
            self.gadget.resets.load(Ordering::SeqCst)
        }

        fn usb0(&self) -> &InterfaceState {
            self.keeper.links.get("usb0").unwrap()
        }

        fn host_reachable(&self, reachable: bool) {
            self.net.set_reply(HOST, reachable);
            if reachable {
                self.net.set_neighbor(HOST, NeighborState::Reachable);
            } else {
                self.net.clear_neighbors();
            }
        }
    }

    #[tokio::test]
    async fn test_never_connected_is_never_reset() {
        let mut h = Harness::new(None);
        h.start().await;

        for tick in 1..=100 {
            h.tick_at(tick * 2).await;
        }

        assert_eq!(h.resets(), 0);
        assert_eq!(h.usb0().counters.fail_no_ip, 100);
        assert_eq!(h.usb0().connection, LinkStatus::Waiting);
    }

    #[tokio::test]
    async fn test_lost_host_reset_on_third_failure() {
        let mut h = Harness::new(None);
        h.start().await;

        h.host_reachable(true);
        h.tick_at(2).await;
        assert!(h.usb0().is_connected);
        assert!(h.keeper.store.connected_once("usb0"));

        h.host_reachable(false);
        h.tick_at(4).await;
        h.tick_at(6).await;
        assert_eq!(h.resets(), 0);
        assert_eq!(h.usb0().counters.fail_no_ping, 2);

        h.tick_at(8).await;
        assert_eq!(h.resets(), 1);

        // Everything learned about the host is dropped
        assert!(h.usb0().counters == Counters::default());
        assert_eq!(h.usb0().last_host_ip, None);
        assert!(h.keeper.power.wake_detected_at.is_some());
    }

    #[tokio::test]
    async fn test_persisted_connection_survives_restart() {
        let mut h = Harness::new(Some("usb0:connected:198.18.42.17:true"));
        h.start().await;
        assert_eq!(h.usb0().last_host_ip, Some(HOST));

        // Host gone after restart: cached address, patient reconnect path
        h.host_reachable(false);
        for tick in 1..=3 {
            h.tick_at(tick * 2).await;
        }
        assert_eq!(h.resets(), 1);
    }

    #[tokio::test]
    async fn test_idle_host_is_not_reset() {
        let mut h = Harness::new(Some("usb0:connected:198.18.42.17:true"));
        h.start().await;

        // No echo replies, but ARP still valid
        h.net.set_neighbor(HOST, NeighborState::Stale);
        for tick in 1..=10 {
            h.tick_at(tick * 2).await;
        }
        assert_eq!(h.resets(), 0);
        assert!(h.usb0().is_idle);
        assert_eq!(h.usb0().connection, LinkStatus::Connected);
    }

    #[tokio::test]
    async fn test_double_sleep_resets_counters_once() {
        let mut h = Harness::new(None);
        h.start().await;
        let now = h.base + Duration::from_secs(2);

        h.keeper.links.get_mut("usb0").unwrap().counters.fail_no_ip = 2;
        h.set_signals(Signal::Set, Signal::Clear);
        h.keeper.handle_power_event(now).await;
        assert!(h.keeper.power.host_is_sleeping);
        assert!(h.usb0().counters == Counters::default());

        h.keeper.links.get_mut("usb0").unwrap().counters.fail_no_ip = 2;
        // Unchanged signals, then the second signal follows
        h.keeper.handle_power_event(now).await;
        h.set_signals(Signal::Set, Signal::Set);
        h.keeper.handle_power_event(now).await;
        assert_eq!(h.usb0().counters.fail_no_ip, 2);
    }

    #[tokio::test]
    async fn test_wake_clears_flags_and_refreshes_neighbors() {
        let mut h = Harness::with_interfaces(None, &["usb0", "usb1"]);
        *h.net.subnet.lock().unwrap() = Some("198.18.42.0/24".parse().unwrap());
        h.start().await;

        // Silent but present in the neighbor table: idle and connected
        h.net.set_reply(HOST, false);
        h.net.set_neighbor(HOST, NeighborState::Reachable);
        h.tick_at(2).await;
        for name in ["usb0", "usb1"] {
            let link = h.keeper.links.get(name).unwrap();
            assert!(link.is_idle && link.is_connected);
        }

        h.set_signals(Signal::Set, Signal::Clear);
        h.keeper.handle_power_event(h.base + Duration::from_secs(4)).await;
        assert!(h.keeper.power.host_is_sleeping);
        let before = h.net.broadcasts.lock().unwrap().len();

        h.set_signals(Signal::Clear, Signal::Clear);
        let woke_at = h.base + Duration::from_secs(6);
        h.keeper.handle_power_event(woke_at).await;

        assert_eq!(h.keeper.power.wake_detected_at, Some(woke_at));
        let broadcasts = h.net.broadcasts.lock().unwrap().clone();
        assert_eq!(
            &broadcasts[before..],
            &[Ipv4Addr::new(198, 18, 42, 255); 2][..]
        );
        for name in ["usb0", "usb1"] {
            let link = h.keeper.links.get(name).unwrap();
            assert!(!link.is_idle && !link.is_connected);
            assert!(link.counters == Counters::default());
        }
    }

    #[tokio::test]
    async fn test_reset_deferred_while_asleep_then_turbo() {
        let mut h = Harness::new(Some("usb0:connected:198.18.42.17:true"));
        h.set_signals(Signal::Set, Signal::Set);
        h.start().await;
        assert!(h.keeper.power.host_is_sleeping);

        h.host_reachable(false);
        for tick in 1..=4 {
            h.tick_at(tick * 2).await;
        }
        assert_eq!(h.resets(), 0);

        // Wake: counters restart and the grace period holds the first failure
        h.set_signals(Signal::Clear, Signal::Clear);
        h.tick_at(10).await;
        assert!(!h.keeper.power.host_is_sleeping);
        assert_eq!(h.usb0().counters.fail_no_ping, 1);
        assert_eq!(h.resets(), 0);

        // Past the grace period, inside the turbo window
        h.tick_at(12).await;
        assert_eq!(h.resets(), 1);
    }

    #[tokio::test]
    async fn test_not_attached_patience() {
        let mut h = Harness::new(None);
        h.set_usb(UsbState::NotAttached);
        h.start().await;

        for tick in 1..=24 {
            h.tick_at(tick * 2).await;
        }
        assert_eq!(h.resets(), 0);
        assert_eq!(h.usb0().connection, LinkStatus::Disconnected);

        h.tick_at(50).await;
        assert_eq!(h.resets(), 1);
    }

    #[tokio::test]
    async fn test_usb_transitions_and_counters() {
        let mut h = Harness::new(Some("usb0:waiting:198.18.42.17:true"));
        h.start().await;

        h.host_reachable(false);
        h.tick_at(2).await;
        h.tick_at(4).await;
        assert_eq!(h.usb0().counters.fail_no_ping, 2);

        // Entering NotAttached keeps the counters
        h.set_usb(UsbState::NotAttached);
        h.tick_at(6).await;
        assert_eq!(h.usb0().counters.fail_no_ping, 2);
        assert_eq!(h.usb0().counters.not_attached, 1);

        // Any other transition clears them
        h.set_usb(UsbState::Suspended);
        h.tick_at(8).await;
        assert!(h.usb0().counters == Counters::default());
        assert!(h.usb0().suspended_logged);
    }

    #[tokio::test]
    async fn test_unknown_usb_state_changes_nothing() {
        let mut h = Harness::new(None);
        h.start().await;
        h.tick_at(2).await;
        let before = h.usb0().counters;

        h.set_usb(UsbState::Unknown);
        h.tick_at(4).await;
        assert_eq!(h.usb0().counters, before);
        assert_eq!(h.usb0().usb_state, UsbState::Configured);
    }

    #[tokio::test]
    async fn test_failed_reset_falls_back_to_setup() {
        let mut h = Harness::new(None);
        h.set_usb(UsbState::NotAttached);
        h.gadget.fail_reset.store(true, Ordering::SeqCst);
        h.start().await;

        for tick in 1..=25 {
            h.tick_at(tick * 2).await;
        }
        assert_eq!(h.resets(), 1);
        assert_eq!(h.keeper.mode, Mode::NotBound);

        let delay = h.tick_at(52).await;
        assert_eq!(h.gadget.setups.load(Ordering::SeqCst), 2);
        assert_eq!(h.keeper.mode, Mode::Normal);
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_next_interval() {
        let mut h = Harness::new(None);
        assert_eq!(h.keeper.next_interval(h.base), Duration::from_secs(10));
        h.start().await;

        // Waiting
        assert_eq!(h.tick_at(2).await, Duration::from_secs(2));

        h.host_reachable(true);
        assert_eq!(h.tick_at(4).await, Duration::from_secs(5));

        // Connected inside the turbo window after a wake
        h.set_signals(Signal::Set, Signal::Clear);
        h.tick_at(6).await;
        h.set_signals(Signal::Clear, Signal::Clear);
        assert_eq!(h.tick_at(8).await, Duration::from_secs(1));

        h.set_usb(UsbState::Suspended);
        assert_eq!(h.tick_at(30).await, Duration::from_secs(1));
    }
}
