pub mod freq;
pub mod model;
pub mod msr;
pub mod platform;
pub mod sysfs;

use std::collections::HashMap;
use std::time::Duration;

use tracing::info;

use crate::error::SourceError;

use self::model::PlatformModel;
use self::msr::MsrReader;
use self::platform::{PlatformMeter, PlatformReading};
use self::sysfs::PowercapReader;

/// Cumulative component energy of one socket, millijoules.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComponentsEnergy {
    pub package_mj: u64,
    pub core_mj: u64,
    pub uncore_mj: u64,
    pub dram_mj: u64,
}

/// Backend for the per-socket component counters.
///
/// Resolved once at startup: the sysfs counters are preferred; the
/// model-specific registers are tried only when explicitly enabled; the null
/// backend reports zeros and `is_supported() == false`.
pub enum ComponentBackend {
    Sysfs(PowercapReader),
    Msr(MsrReader),
    Null,
}

impl ComponentBackend {
    pub fn select(enable_msr: bool) -> Self {
        match PowercapReader::probe_default() {
            Ok(reader) => {
                info!("component energy from powercap sysfs counters");
                return Self::Sysfs(reader);
            }
            Err(e) => info!(error = %e, "sysfs energy counters not usable"),
        }

        if enable_msr {
            match MsrReader::probe_default() {
                Ok(reader) => {
                    info!("component energy from model-specific registers");
                    return Self::Msr(reader);
                }
                Err(e) => info!(error = %e, "msr energy source not usable"),
            }
        }

        info!("no component energy source, reporting zeros");
        Self::Null
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Null)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sysfs(_) => "sysfs",
            Self::Msr(_) => "msr",
            Self::Null => "null",
        }
    }

    /// Cumulative millijoules per socket.
    pub fn components_by_socket(&self) -> Result<HashMap<u32, ComponentsEnergy>, SourceError> {
        match self {
            Self::Sysfs(reader) => reader.read(),
            Self::Msr(reader) => reader.read(),
            Self::Null => Ok(HashMap::new()),
        }
    }

    pub fn energy_package(&self) -> Result<u64, SourceError> {
        Ok(self
            .components_by_socket()?
            .values()
            .map(|c| c.package_mj)
            .sum())
    }

    pub fn energy_core(&self) -> Result<u64, SourceError> {
        Ok(self
            .components_by_socket()?
            .values()
            .map(|c| c.core_mj)
            .sum())
    }

    pub fn energy_uncore(&self) -> Result<u64, SourceError> {
        Ok(self
            .components_by_socket()?
            .values()
            .map(|c| c.uncore_mj)
            .sum())
    }

    pub fn energy_dram(&self) -> Result<u64, SourceError> {
        Ok(self
            .components_by_socket()?
            .values()
            .map(|c| c.dram_mj)
            .sum())
    }

    /// Release any backing handles. The sysfs and msr readers hold only
    /// paths, so there is nothing to release today.
    pub fn stop(&mut self) {}
}

/// Whole-node platform energy: a hardware meter when present, otherwise an
/// optional trained regression. Measured wins over estimated.
pub enum PlatformSource {
    Meter(PlatformMeter),
    Model(PlatformModel),
    None,
}

impl PlatformSource {
    pub fn select(model_server_endpoint: &str) -> Self {
        match PlatformMeter::probe_default() {
            Ok(meter) => {
                info!("platform energy from hardware meter");
                return Self::Meter(meter);
            }
            Err(e) => info!(error = %e, "no platform power meter"),
        }

        if !model_server_endpoint.is_empty() {
            match PlatformModel::fetch(model_server_endpoint) {
                Ok(model) => {
                    info!("platform energy estimated by trained model");
                    return Self::Model(model);
                }
                Err(e) => {
                    info!(error = %e, "model server unreachable, using builtin coefficients");
                    return Self::Model(PlatformModel::builtin_default());
                }
            }
        }

        info!("platform energy disabled");
        Self::None
    }

    pub fn is_measured(&self) -> bool {
        matches!(self, Self::Meter(_))
    }

    /// One platform observation for the tick window. `usage_deltas` carries
    /// the node's committed per-resource deltas for model inference.
    pub fn read(
        &self,
        window: Duration,
        usage_deltas: &HashMap<&'static str, u64>,
    ) -> Result<Option<PlatformReading>, SourceError> {
        match self {
            Self::Meter(meter) => meter.read(window).map(Some),
            Self::Model(model) => Ok(Some(PlatformReading::Delta(
                model.estimate_mj(usage_deltas, window),
            ))),
            Self::None => Ok(None),
        }
    }
}
