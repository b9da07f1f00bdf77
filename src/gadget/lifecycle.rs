//! Gadget lifecycle manager
//!
//! Sequences the gadget through cleanup, configure, controller acquisition,
//! bind and interface bring-up. The same sequence serves boot (patient,
//! optionally timed) and runtime resets (short controller wait).

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::builder::{builder_from_config, GadgetBuilder};
use super::configfs::{self, find_udc, write_file};
use super::driver::{driver_from_config, ControllerDriver};
use crate::config::{GadgetConfig, KeeperConfig};
use crate::error::{AppError, Result};
use crate::net::NetProbe;
use crate::utils::{poll_until, Backoff};

/// Settle time after writing the UDC attribute
const REBIND_DELAY: Duration = Duration::from_millis(300);

/// What the control loop needs from the lifecycle manager
#[async_trait]
pub trait GadgetControl: Send {
    /// Tear down and rebuild the gadget, forcing the host to re-enumerate
    async fn reset(&mut self) -> Result<()>;

    /// Boot-time setup; adopts a gadget that is already bound
    async fn initial_setup(&mut self) -> Result<()>;
}

/// Per-step timing log for boot setup
struct StepTimer {
    enabled: bool,
    started: Instant,
    last: Instant,
}

impl StepTimer {
    fn new(enabled: bool) -> Self {
        let now = Instant::now();
        Self {
            enabled,
            started: now,
            last: now,
        }
    }

    fn step(&mut self, name: &str) {
        if self.enabled {
            let now = Instant::now();
            info!("[timing] {}: {:?}", name, now - self.last);
            self.last = now;
        }
    }

    fn finish(&self) {
        if self.enabled {
            info!("[timing] total: {:?}", self.started.elapsed());
        }
    }
}

pub struct GadgetLifecycle {
    builder: Box<dyn GadgetBuilder>,
    driver: Box<dyn ControllerDriver>,
    net: Arc<dyn NetProbe>,
    config: GadgetConfig,
    /// Interfaces brought up after bind
    interfaces: Vec<String>,
    udc: Option<String>,
    udc_class_dir: PathBuf,
    bound_udc: Option<String>,
}

impl GadgetLifecycle {
    pub fn new(
        config: &KeeperConfig,
        builder: Box<dyn GadgetBuilder>,
        driver: Box<dyn ControllerDriver>,
        net: Arc<dyn NetProbe>,
    ) -> Self {
        Self {
            builder,
            driver,
            net,
            config: config.gadget.clone(),
            interfaces: config.monitor.interfaces.clone(),
            udc: config.observer.udc.clone(),
            udc_class_dir: config.observer.udc_class_dir.clone(),
            bound_udc: None,
        }
    }

    /// Lifecycle with the configured builder and driver
    pub fn from_config(config: &KeeperConfig, net: Arc<dyn NetProbe>) -> Self {
        Self::new(
            config,
            builder_from_config(&config.gadget),
            driver_from_config(config.gadget.driver_module.as_deref()),
            net,
        )
    }

    fn udc_file(&self) -> PathBuf {
        self.builder.gadget_path().join("UDC")
    }

    pub fn gadget_exists(&self) -> bool {
        self.builder.gadget_path().exists()
    }

    pub fn is_bound(&self) -> bool {
        configfs::is_bound(self.builder.gadget_path())
    }

    pub fn bound_udc(&self) -> Option<&str> {
        self.bound_udc.as_deref()
    }

    /// The configured controller if present, else the first one found
    pub fn find_controller(&self) -> Option<String> {
        match self.udc {
            Some(ref udc) => self
                .udc_class_dir
                .join(udc)
                .exists()
                .then(|| udc.clone()),
            None => find_udc(&self.udc_class_dir),
        }
    }

    /// Unbind if bound, then discard the gadget tree. Idempotent.
    pub async fn cleanup(&mut self) -> Result<()> {
        if self.is_bound() {
            write_file(&self.udc_file(), "")?;
            self.bound_udc = None;
            info!("Unbound gadget from UDC");
            tokio::time::sleep(REBIND_DELAY).await;
        }
        self.builder.discard().await
    }

    /// Build the gadget tree; nothing is bound on failure
    pub async fn configure(&mut self) -> Result<()> {
        self.builder.configure().await
    }

    /// Poll for a controller, at most `max_ticks` times
    pub async fn wait_for_controller(&self, max_ticks: u32) -> Option<String> {
        poll_until(max_ticks, Backoff::fixed(self.config.controller_poll()), || {
            self.find_controller()
        })
        .await
    }

    /// Attach the gadget to `udc`. Not retried here.
    pub async fn bind(&mut self, udc: &str) -> Result<()> {
        info!("Binding gadget to UDC: {}", udc);
        write_file(&self.udc_file(), udc)?;
        self.bound_udc = Some(udc.to_string());
        tokio::time::sleep(REBIND_DELAY).await;
        Ok(())
    }

    /// Load the driver and wait for a controller, reloading the driver a
    /// bounded number of times when none shows up
    async fn acquire_controller(&mut self, max_ticks: u32) -> Result<String> {
        if let Err(e) = self.driver.load().await {
            warn!("Failed to load controller driver: {}", e);
        }
        if let Some(udc) = self.wait_for_controller(max_ticks).await {
            return Ok(udc);
        }

        let attempts = self.config.driver_reload_attempts;
        for attempt in 1..=attempts {
            warn!(
                "No USB Device Controller found, reloading driver ({}/{})",
                attempt, attempts
            );
            if let Err(e) = self.driver.reload().await {
                warn!("Driver reload failed: {}", e);
            }
            tokio::time::sleep(self.config.driver_reload_wait()).await;

            if let Some(udc) = self.wait_for_controller(max_ticks).await {
                info!("Controller {} appeared after driver reload", udc);
                return Ok(udc);
            }
        }

        Err(AppError::ControllerUnavailable { attempts })
    }

    /// Set the monitored interfaces up; failures are logged only
    async fn bring_up(&self) {
        let exposed = self.builder.interfaces();
        if !exposed.is_empty() {
            debug!("Gadget exposes interfaces: {}", exposed.join(", "));
        }

        for iface in &self.interfaces {
            match self.net.link_up(iface).await {
                Ok(()) => debug!("{} is up", iface),
                Err(e) => warn!("Failed to bring up {}: {}", iface, e),
            }
        }
    }

    async fn run_sequence(&mut self, max_ticks: u32, timing: bool) -> Result<()> {
        let mut timer = StepTimer::new(timing);

        self.cleanup().await?;
        timer.step("cleanup");

        self.configure().await?;
        timer.step("configure");

        let udc = self.acquire_controller(max_ticks).await?;
        timer.step("controller");

        self.bind(&udc).await?;
        timer.step("bind");

        self.bring_up().await;
        timer.step("link up");

        timer.finish();
        Ok(())
    }
}

#[async_trait]
impl GadgetControl for GadgetLifecycle {
    async fn reset(&mut self) -> Result<()> {
        info!("Resetting USB gadget");
        self.run_sequence(self.config.runtime_controller_ticks, false)
            .await?;
        info!("USB gadget reset complete");
        Ok(())
    }

    async fn initial_setup(&mut self) -> Result<()> {
        if self.gadget_exists() && self.is_bound() {
            info!("Gadget already exists and is bound, skipping setup");
            self.bring_up().await;
            return Ok(());
        }

        info!("Setting up USB gadget");
        self.run_sequence(self.config.boot_controller_ticks, self.config.timing)
            .await?;
        info!("USB gadget setup complete");
        Ok(())
    }
}
