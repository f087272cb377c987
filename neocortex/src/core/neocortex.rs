//! # Neocortex Facade
//!
//! Wires every cortex module over one store and one relay, and owns the
//! lifecycle of the circadian clock.

use std::sync::Arc;

use tracing::{info, warn};

use crate::configs::{default_entries, NeocortexSettings};
use crate::core::auditory::Auditory;
use crate::core::circadian::Circadian;
use crate::core::hippocampus::Hippocampus;
use crate::core::limbic::SignalBus;
use crate::core::mailer::Mailer;
use crate::core::middleware::MutationObserver;
use crate::core::motor::Motor;
use crate::core::plasticity::Plasticity;
use crate::core::prefrontal::Prefrontal;
use crate::core::relay::Relay;
use crate::error::Result;
use crate::store::Store;

/// The whole nervous system. Cloning shares the same modules.
#[derive(Clone)]
pub struct Neocortex {
    store: Arc<dyn Store>,
    relay: Arc<dyn Relay>,
    bus: SignalBus,
    hippocampus: Hippocampus,
    plasticity: Plasticity,
    prefrontal: Prefrontal,
    auditory: Auditory,
    motor: Motor,
    observer: Arc<MutationObserver>,
    circadian: Circadian,
}

impl Neocortex {
    pub fn new(store: Arc<dyn Store>, relay: Arc<dyn Relay>, settings: NeocortexSettings) -> Self {
        let bus = SignalBus::new(store.clone(), relay.clone());
        let hippocampus = Hippocampus::new(store.clone());
        let plasticity = Plasticity::new(store.clone(), relay.clone());
        let prefrontal = Prefrontal::new(plasticity.clone(), hippocampus.clone(), bus.clone());
        let auditory = Auditory::new(store.clone());
        let motor = Motor::with_builtin_handlers(store.clone(), bus.clone(), Mailer::new(settings.mailer));
        let observer = Arc::new(MutationObserver::new(bus.clone(), hippocampus.clone()));
        let circadian = Circadian::new(
            store.clone(),
            bus.clone(),
            hippocampus.clone(),
            auditory.clone(),
            motor.clone(),
            plasticity.clone(),
            settings.clock,
        );

        Self {
            store,
            relay,
            bus,
            hippocampus,
            plasticity,
            prefrontal,
            auditory,
            motor,
            observer,
            circadian,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn relay(&self) -> &Arc<dyn Relay> {
        &self.relay
    }

    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    pub fn hippocampus(&self) -> &Hippocampus {
        &self.hippocampus
    }

    pub fn plasticity(&self) -> &Plasticity {
        &self.plasticity
    }

    pub fn prefrontal(&self) -> &Prefrontal {
        &self.prefrontal
    }

    pub fn auditory(&self) -> &Auditory {
        &self.auditory
    }

    pub fn motor(&self) -> &Motor {
        &self.motor
    }

    pub fn observer(&self) -> &Arc<MutationObserver> {
        &self.observer
    }

    pub fn circadian(&self) -> &Circadian {
        &self.circadian
    }

    /// Writes the default dynamic configuration entries that are missing.
    /// Returns how many were created.
    pub async fn seed_defaults(&self) -> Result<usize> {
        let mut created = 0;
        for (key, value, description) in default_entries() {
            if self.store.get_config(key).await?.is_none() {
                self.store
                    .upsert_config(key, &value, Some(description), Some("system"))
                    .await?;
                created += 1;
            }
        }
        if created > 0 {
            info!("[Plasticite] Seeded {} default config entries", created);
        }
        Ok(created)
    }

    /// Starts the circadian clock.
    pub async fn start(&self) -> Result<()> {
        info!("NEOCORTEX started");
        info!("   Limbique   -> weighted signal bus");
        info!("   Hippocampe -> memory & audit trail");
        info!("   Prefrontal -> decisions & workflows");
        info!("   Plasticite -> dynamic configuration");
        info!("   Auditif    -> notifications");
        info!("   Moteur     -> async tasks");
        info!("   Circadien  -> scheduled jobs");
        self.circadian.start().await
    }

    /// Stops the circadian clock.
    pub async fn stop(&self) -> Result<()> {
        info!("NEOCORTEX stopping");
        if let Err(e) = self.circadian.stop().await {
            warn!("Circadian clock did not stop cleanly: {}", e);
            return Err(e);
        }
        Ok(())
    }
}
