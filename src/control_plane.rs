//! Explicit construction and ordered startup/shutdown of every component
//!
//! Startup order: bus, probe, supervisor, bridge. Shutdown runs in reverse and
//! drains the bus last unless the stop is urgent.

use crate::bridge::IntegrationBridge;
use crate::bus::MessageBus;
use crate::config::AppConfig;
use crate::coordination::{Shutdown, ShutdownPhase, ShutdownSignal};
use crate::emergency::{BusInterventionExecutor, EmergencyDetector, ProtocolTable};
use crate::error::{HiveError, Result};
use crate::monitoring::{default_host_probe, AgentRegistry, HostProbe, MonitoringProbe};
use crate::services::HealthState;
use crate::supervisor::{DecisionProvider, RollingZScore, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Upper bound on waiting for in-flight deliveries at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on waiting for a periodic loop to exit
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ControlPlane {
    config: AppConfig,
    bus: MessageBus,
    registry: Arc<AgentRegistry>,
    detector: Arc<EmergencyDetector>,
    probe: Arc<MonitoringProbe>,
    supervisor: Arc<Supervisor>,
    bridge: Arc<IntegrationBridge>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<String>>,
}

impl ControlPlane {
    /// Build with the platform host probe and no external decision provider
    pub fn build(config: &AppConfig) -> Result<Self> {
        Self::build_with(config, default_host_probe(), None)
    }

    pub fn build_with(
        config: &AppConfig,
        host: Arc<dyn HostProbe>,
        decision_provider: Option<Arc<dyn DecisionProvider>>,
    ) -> Result<Self> {
        config.validate().map_err(|errors| {
            HiveError::FatalConfiguration(format!("invalid configuration: {}", errors.join("; ")))
        })?;

        let bus = MessageBus::new(config.bus.clone());
        let registry = Arc::new(AgentRegistry::new());

        let detector = Arc::new(EmergencyDetector::new(
            config.emergency.clone(),
            bus.clone(),
            Arc::clone(&registry),
            ProtocolTable::default(),
            Arc::new(BusInterventionExecutor::new(bus.clone())),
        ));

        let probe = Arc::new(
            MonitoringProbe::new(
                config.monitoring.clone(),
                bus.clone(),
                Arc::clone(&registry),
                host,
            )
            .with_emergency_gauge(detector.active_gauge()),
        );

        let mut supervisor = Supervisor::new(
            config.supervisor.clone(),
            bus.clone(),
            Arc::clone(&registry),
            Arc::clone(&probe),
            Arc::clone(&detector),
        );
        if let Some(provider) = decision_provider {
            supervisor = supervisor.with_decision_provider(provider);
        }
        if config.supervisor.anomaly_detection {
            supervisor = supervisor.with_anomaly_detector(Arc::new(RollingZScore::default()));
        }

        let bridge = Arc::new(IntegrationBridge::new(config.bridge.clone(), bus.clone()));

        Ok(Self {
            config: config.clone(),
            bus,
            registry,
            detector,
            probe,
            supervisor: Arc::new(supervisor),
            bridge,
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn detector(&self) -> &Arc<EmergencyDetector> {
        &self.detector
    }

    pub fn probe(&self) -> &Arc<MonitoringProbe> {
        &self.probe
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn bridge(&self) -> &Arc<IntegrationBridge> {
        &self.bridge
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.shutdown.phase()
    }

    /// State for the health/status HTTP surface
    pub fn health_state(&self) -> Arc<HealthState> {
        Arc::new(HealthState::new(
            self.bus.clone(),
            Arc::clone(&self.probe),
            Arc::clone(&self.detector),
            Arc::clone(&self.supervisor),
            Arc::clone(&self.bridge),
        ))
    }

    /// Start the bus consumer, subscribe every component and spawn the loops
    pub async fn start(&self) -> Result<()> {
        self.bus.start().await?;

        let probe_sub = self.probe.attach().await?;
        let supervisor_sub = self.supervisor.attach().await?;
        self.subscriptions
            .lock()
            .await
            .extend([probe_sub, supervisor_sub]);

        self.bridge.start().await?;

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.probe.start(self.shutdown.token()));
        tasks.push(self.supervisor.start(self.shutdown.token()));

        info!(
            thresholds = self.detector.thresholds().len(),
            anomaly_detection = self.config.supervisor.anomaly_detection,
            "Control plane started"
        );
        Ok(())
    }

    /// Stop the loops, the bridge and the subscriptions, then drain and stop the bus
    pub async fn shutdown(&self, signal: ShutdownSignal) {
        if !self.shutdown.request() {
            return;
        }
        info!(%signal, "Control plane shutting down");

        self.shutdown.set_phase(ShutdownPhase::StoppingLoops);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(LOOP_STOP_TIMEOUT, task).await.is_err() {
                warn!("Loop did not stop within {:?}", LOOP_STOP_TIMEOUT);
            }
        }

        self.bridge.stop().await;
        let subscriptions: Vec<String> = self.subscriptions.lock().await.drain(..).collect();
        for subscription_id in subscriptions {
            self.bus.unsubscribe(&subscription_id).await;
        }

        if signal.drains_bus() {
            self.shutdown.set_phase(ShutdownPhase::DrainingBus);
            if !self.bus.drain(DRAIN_TIMEOUT).await {
                warn!("Bus drain timed out after {:?}", DRAIN_TIMEOUT);
            }
        }
        self.bus.stop().await;

        self.shutdown.set_phase(ShutdownPhase::Complete);
        info!("Control plane stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::{HostSample, StaticHostProbe};

    fn host() -> Arc<dyn HostProbe> {
        Arc::new(StaticHostProbe {
            sample: HostSample::default(),
        })
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let mut config = AppConfig::default();
        config.bus.dead_letter_max_size = 0;

        let err = ControlPlane::build_with(&config, host(), None).err().unwrap();
        assert!(matches!(err, HiveError::FatalConfiguration(_)));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let plane = ControlPlane::build_with(&AppConfig::default(), host(), None).unwrap();
        plane.start().await.unwrap();

        assert!(plane.bus().is_running());
        assert!(plane.bridge().is_running());
        assert_eq!(plane.phase(), ShutdownPhase::Running);

        plane.shutdown(ShutdownSignal::Graceful).await;
        assert!(!plane.bus().is_running());
        assert!(!plane.bridge().is_running());
        assert_eq!(plane.phase(), ShutdownPhase::Complete);

        // Second request is a no-op
        plane.shutdown(ShutdownSignal::Urgent).await;
        assert_eq!(plane.phase(), ShutdownPhase::Complete);
    }
}
