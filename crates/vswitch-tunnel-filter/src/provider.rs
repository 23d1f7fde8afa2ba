//! Provider and sublayer registration
//!
//! The provider record advertises this driver to the filtering engine; the
//! sublayer is the ordering context our filters evaluate under. Both exist
//! only while the engine is known to be running, and re-provisioning after
//! an engine restart may retrigger registration at any time, so both add and
//! remove are idempotent.

use crate::config::FilterConfig;
use crate::engine::{FilterEngine, ProviderDesc, SessionId, SublayerDesc};
use crate::error::{FilterError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stable provider key for this driver
pub const PROVIDER_KEY: Uuid = Uuid::from_u128(0x8c0b2e3f_5d41_4a7e_9b67_2f1a6c0d4e21);
/// Stable sublayer key for this driver
pub const SUBLAYER_KEY: Uuid = Uuid::from_u128(0x8c0b2e3f_5d41_4a7e_9b67_2f1a6c0d4e22);

/// Registers this driver's identity records. Control-path only.
pub struct ProviderRegistrant {
    engine: Arc<dyn FilterEngine>,
    provider_name: String,
    provider_description: String,
    sublayer_weight: u16,
    registered: bool,
}

impl ProviderRegistrant {
    pub(crate) fn new(engine: Arc<dyn FilterEngine>, config: &FilterConfig) -> Self {
        Self {
            engine,
            provider_name: config.provider_name.clone(),
            provider_description: config.provider_description.clone(),
            sublayer_weight: config.sublayer_weight,
            registered: false,
        }
    }

    /// Register the provider, then the sublayer referencing it.
    ///
    /// Idempotent: a repeated call (or an engine that still remembers the
    /// records) succeeds without duplicating anything. A sublayer failure
    /// rolls the provider back before the error is returned.
    pub fn add_system_provider(&mut self, session: SessionId) -> Result<()> {
        if self.registered {
            debug!("system provider already registered");
            return Ok(());
        }

        let provider = ProviderDesc {
            key: PROVIDER_KEY,
            name: self.provider_name.clone(),
            description: self.provider_description.clone(),
        };
        match self.engine.add_provider(session, &provider) {
            Ok(()) | Err(FilterError::AlreadyRegistered { .. }) => {}
            Err(err) => return Err(err),
        }

        let sublayer = SublayerDesc {
            key: SUBLAYER_KEY,
            provider_key: PROVIDER_KEY,
            name: self.provider_name.clone(),
            weight: self.sublayer_weight,
        };
        match self.engine.add_sublayer(session, &sublayer) {
            Ok(()) | Err(FilterError::AlreadyRegistered { .. }) => {}
            Err(err) => {
                warn!(%err, "sublayer registration failed, rolling back provider");
                if let Err(err) = self.engine.remove_provider(session, PROVIDER_KEY) {
                    debug!(%err, "provider rollback failed");
                }
                return Err(err);
            }
        }

        self.registered = true;
        info!("system provider and sublayer registered");
        Ok(())
    }

    /// Remove the sublayer, then the provider. Idempotent: safe when not
    /// registered, and tolerant of an engine that already forgot the records
    /// (it wipes them on restart).
    pub fn remove_system_provider(&mut self, session: SessionId) {
        if !self.registered {
            return;
        }

        if let Err(err) = self.engine.remove_sublayer(session, SUBLAYER_KEY) {
            debug!(%err, "sublayer removal failed");
        }
        if let Err(err) = self.engine.remove_provider(session, PROVIDER_KEY) {
            debug!(%err, "provider removal failed");
        }
        self.registered = false;
        info!("system provider and sublayer removed");
    }

    /// True while the identity records are registered
    pub fn is_registered(&self) -> bool {
        self.registered
    }
}
