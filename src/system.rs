//! Laptop embedded-controller control: fan RPM, power modes, boost.
//!
//! SET_FAN_MODE is a combined command that programs the power profile and
//! the fan RPM in one call, per fan index. Changing one side always
//! rewrites the other with its current value.

use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use chroma_transport::commands;

use crate::device::{ChromaDevice, DeviceError};
use crate::hardware::{Capability, FanLimits, HardwareEntry};
use crate::prefs::Preferences;
use crate::util::Signal;

/// Laptop power profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Balanced,
    Gaming,
    Creator,
    Custom,
}

impl PowerMode {
    pub fn value(self) -> u8 {
        match self {
            PowerMode::Balanced => 0,
            PowerMode::Gaming => 1,
            PowerMode::Creator => 2,
            PowerMode::Custom => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PowerMode::Balanced),
            1 => Some(PowerMode::Gaming),
            2 => Some(PowerMode::Creator),
            4 => Some(PowerMode::Custom),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PowerMode::Balanced => "balanced",
            PowerMode::Gaming => "gaming",
            PowerMode::Creator => "creator",
            PowerMode::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "balanced" => Some(PowerMode::Balanced),
            "gaming" => Some(PowerMode::Gaming),
            "creator" => Some(PowerMode::Creator),
            "custom" => Some(PowerMode::Custom),
            _ => None,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            PowerMode::Balanced => "Quiet operation with conservative cooling",
            PowerMode::Gaming => "Maximum performance with aggressive cooling",
            PowerMode::Creator => "Optimized for GPU workloads",
            PowerMode::Custom => "Manual control of fan speeds and boost levels",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanMode {
    #[default]
    Auto,
    Manual,
}

/// CPU/GPU boost levels, used with the CUSTOM power mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoostMode {
    #[default]
    Low,
    Medium,
    High,
    Boost,
}

impl BoostMode {
    pub fn value(self) -> u8 {
        match self {
            BoostMode::Low => 0,
            BoostMode::Medium => 1,
            BoostMode::High => 2,
            BoostMode::Boost => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BoostMode::Low),
            1 => Some(BoostMode::Medium),
            2 => Some(BoostMode::High),
            3 => Some(BoostMode::Boost),
            _ => None,
        }
    }
}

#[derive(Default)]
struct CachedState {
    power_mode: Option<PowerMode>,
    fan_mode: FanMode,
    fan_rpm: (u32, Option<u32>),
    fan_setting_rpm: (u32, Option<u32>),
    cpu_boost: BoostMode,
    gpu_boost: BoostMode,
    last_refresh: Option<Instant>,
}

/// EC command surface for one laptop.
pub struct SystemControl {
    device: Weak<ChromaDevice>,
    limits: FanLimits,
    supports_fan_speed: bool,
    supports_boost: bool,
    cache: Mutex<CachedState>,
    refresh_lock: AsyncMutex<()>,
    pub fan_changed: Signal<()>,
    pub power_mode_changed: Signal<PowerMode>,
}

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

impl SystemControl {
    pub fn new(device: Weak<ChromaDevice>, hardware: &HardwareEntry) -> Self {
        Self {
            device,
            limits: hardware.fan_limits.unwrap_or_default(),
            supports_fan_speed: hardware.has_capability(Capability::EcFanSpeed),
            supports_boost: hardware.has_capability(Capability::EcBoost),
            cache: Mutex::new(CachedState::default()),
            refresh_lock: AsyncMutex::new(()),
            fan_changed: Signal::new(),
            power_mode_changed: Signal::new(),
        }
    }

    pub fn fan_limits(&self) -> FanLimits {
        self.limits
    }

    pub fn supports_boost(&self) -> bool {
        self.supports_boost
    }

    /// Refresh the cached state, coalesced to at most once per second.
    async fn refresh(&self) {
        let _lock = self.refresh_lock.lock().await;

        let fresh_enough = self
            .cache
            .lock()
            .last_refresh
            .map(|t| t.elapsed() < REFRESH_INTERVAL)
            .unwrap_or(false);
        if fresh_enough {
            return;
        }

        let Some(device) = self.device.upgrade() else {
            return;
        };

        let mut setting_rpm1 = 0u32;
        let mut setting_rpm2 = None;
        let mut power_mode = None;

        if let Ok(Some(result)) = device
            .run_with_result(&commands::GET_FAN_MODE, &[0x00, 0x00, 0x00, 0x00])
            .await
        {
            if result.len() >= 4 {
                power_mode = PowerMode::from_u8(result[2]).or(Some(PowerMode::Balanced));
                setting_rpm1 = result[3] as u32 * 100;
            }
        }

        if self.limits.dual_fan {
            if let Ok(Some(result)) = device
                .run_with_result(&commands::GET_FAN_MODE, &[0x00, 0x01, 0x00, 0x00])
                .await
            {
                if result.len() >= 4 {
                    setting_rpm2 = Some(result[3] as u32 * 100);
                }
            }
        }

        let measured = if self.supports_fan_speed {
            let mut rpm1 = 0u32;
            let mut rpm2 = None;
            if let Ok(Some(result)) = device
                .run_with_result(&commands::GET_FAN_SPEED, &[0x00, 0x00])
                .await
            {
                if result.len() >= 3 {
                    rpm1 = result[2] as u32 * 100;
                }
            }
            if self.limits.dual_fan {
                if let Ok(Some(result)) = device
                    .run_with_result(&commands::GET_FAN_SPEED, &[0x00, 0x01])
                    .await
                {
                    if result.len() >= 3 {
                        rpm2 = Some(result[2] as u32 * 100);
                    }
                }
            }
            (rpm1, rpm2)
        } else {
            (setting_rpm1, setting_rpm2)
        };

        let (cpu_boost, gpu_boost) = if self.supports_boost {
            let cpu = device
                .run_with_result(&commands::GET_BOOST, &[0x01, 0x00])
                .await
                .ok()
                .flatten()
                .and_then(|v| v.first().copied())
                .and_then(BoostMode::from_u8)
                .unwrap_or_default();
            let gpu = device
                .run_with_result(&commands::GET_BOOST, &[0x01, 0x01])
                .await
                .ok()
                .flatten()
                .and_then(|v| v.first().copied())
                .and_then(BoostMode::from_u8)
                .unwrap_or_default();
            (cpu, gpu)
        } else {
            Default::default()
        };

        let mut cache = self.cache.lock();
        cache.power_mode = power_mode;
        cache.fan_mode = if setting_rpm1 > 0 {
            FanMode::Manual
        } else {
            FanMode::Auto
        };
        cache.fan_setting_rpm = (setting_rpm1, setting_rpm2);
        cache.fan_rpm = measured;
        cache.cpu_boost = cpu_boost;
        cache.gpu_boost = gpu_boost;
        cache.last_refresh = Some(Instant::now());
    }

    pub async fn fan_rpm(&self) -> (u32, Option<u32>) {
        self.refresh().await;
        self.cache.lock().fan_rpm
    }

    pub async fn fan_mode(&self) -> FanMode {
        self.refresh().await;
        self.cache.lock().fan_mode
    }

    pub async fn power_mode(&self) -> PowerMode {
        self.refresh().await;
        self.cache.lock().power_mode.unwrap_or(PowerMode::Balanced)
    }

    pub async fn cpu_boost(&self) -> BoostMode {
        self.refresh().await;
        self.cache.lock().cpu_boost
    }

    pub async fn gpu_boost(&self) -> BoostMode {
        self.refresh().await;
        self.cache.lock().gpu_boost
    }

    /// Combined fan/power write for one fan index.
    async fn set_fan_power(
        &self,
        device: &std::sync::Arc<ChromaDevice>,
        mode: PowerMode,
        rpm: u32,
        fan_id: u8,
    ) -> Result<bool, DeviceError> {
        let rpm_value = (rpm / 100) as u8;
        device
            .run_command(
                &commands::SET_FAN_MODE,
                &[0x00, fan_id, mode.value(), rpm_value],
            )
            .await
    }

    /// Hand the fans back to the EC, keeping the current power mode.
    pub async fn set_fan_auto(&self) -> Result<bool, DeviceError> {
        let Some(device) = self.device.upgrade() else {
            return Ok(false);
        };

        let cached = self.cache.lock().power_mode;
        let current = match cached {
            Some(mode) => mode,
            None => self.power_mode().await,
        };

        let ok = self.set_fan_power(&device, current, 0, 0).await?;
        if ok && self.limits.dual_fan {
            self.set_fan_power(&device, current, 0, 1).await?;
        }

        if ok {
            let mut cache = self.cache.lock();
            cache.fan_mode = FanMode::Auto;
            cache.fan_setting_rpm = (0, cache.fan_setting_rpm.1);
            if !self.supports_fan_speed {
                cache.fan_rpm = cache.fan_setting_rpm;
            }
            drop(cache);
            self.fan_changed.fire(&());
        }
        Ok(ok)
    }

    /// Set manual RPM; 0 hands control back to the EC. Manual values must
    /// fall inside the model's safe limits.
    pub async fn set_fan_rpm(
        &self,
        rpm: u32,
        fan2_rpm: Option<u32>,
    ) -> Result<bool, DeviceError> {
        if rpm == 0 {
            return self.set_fan_auto().await;
        }

        if rpm < self.limits.min_manual_rpm {
            return Err(DeviceError::InvalidArgument(format!(
                "RPM {rpm} below minimum {}; use auto mode instead",
                self.limits.min_manual_rpm
            )));
        }
        if rpm > self.limits.max_rpm {
            return Err(DeviceError::InvalidArgument(format!(
                "RPM {rpm} exceeds maximum {}",
                self.limits.max_rpm
            )));
        }

        let Some(device) = self.device.upgrade() else {
            return Ok(false);
        };

        let current = self.cache.lock().power_mode.unwrap_or(PowerMode::Custom);
        let mut ok = self.set_fan_power(&device, current, rpm, 0).await?;

        if ok {
            if let Some(fan2) = fan2_rpm {
                if self.limits.dual_fan {
                    if fan2 < self.limits.min_manual_rpm || fan2 > self.limits.max_rpm {
                        return Err(DeviceError::InvalidArgument(format!(
                            "Fan 2 RPM {fan2} outside limits"
                        )));
                    }
                    ok = self.set_fan_power(&device, current, fan2, 1).await?;
                }
            }
        }

        if ok {
            let mut cache = self.cache.lock();
            cache.fan_mode = FanMode::Manual;
            cache.fan_setting_rpm = (rpm, fan2_rpm);
            if !self.supports_fan_speed {
                cache.fan_rpm = cache.fan_setting_rpm;
            }
            drop(cache);
            self.fan_changed.fire(&());
        }
        Ok(ok)
    }

    /// Switch power profiles while preserving each fan's current RPM
    /// setting. Dual-fan models receive the mode on both fans.
    pub async fn set_power_mode(&self, mode: PowerMode) -> Result<bool, DeviceError> {
        let Some(device) = self.device.upgrade() else {
            return Ok(false);
        };

        let mut current_rpm = 0u32;
        if let Ok(Some(result)) = device
            .run_with_result(&commands::GET_FAN_MODE, &[0x00, 0x00, 0x00, 0x00])
            .await
        {
            if result.len() >= 4 {
                current_rpm = result[3] as u32 * 100;
            }
        }

        let ok = self.set_fan_power(&device, mode, current_rpm, 0).await?;

        if ok && self.limits.dual_fan {
            let mut fan2_rpm = 0u32;
            if let Ok(Some(result)) = device
                .run_with_result(&commands::GET_FAN_MODE, &[0x00, 0x01, 0x00, 0x00])
                .await
            {
                if result.len() >= 4 {
                    fan2_rpm = result[3] as u32 * 100;
                }
            }
            self.set_fan_power(&device, mode, fan2_rpm, 1).await?;
        }

        if ok {
            self.cache.lock().power_mode = Some(mode);
            self.power_mode_changed.fire(&mode);

            device
                .preferences()
                .await
                .update(|p| p.power_mode = Some(mode.name().to_string()));
        }
        Ok(ok)
    }

    pub async fn set_cpu_boost(&self, mode: BoostMode) -> Result<bool, DeviceError> {
        self.set_boost(0x00, mode).await.inspect(|&ok| {
            if ok {
                self.cache.lock().cpu_boost = mode;
            }
        })
    }

    pub async fn set_gpu_boost(&self, mode: BoostMode) -> Result<bool, DeviceError> {
        self.set_boost(0x01, mode).await.inspect(|&ok| {
            if ok {
                self.cache.lock().gpu_boost = mode;
            }
        })
    }

    async fn set_boost(&self, target: u8, mode: BoostMode) -> Result<bool, DeviceError> {
        if !self.supports_boost {
            debug!("Boost control not available on this model");
            return Ok(false);
        }
        let Some(device) = self.device.upgrade() else {
            return Ok(false);
        };
        device
            .run_command(&commands::SET_BOOST, &[0x01, target, mode.value()])
            .await
    }

    /// Restore the saved power mode.
    pub async fn restore_prefs(&self, prefs: &Preferences) {
        if let Some(saved) = prefs.power_mode.as_deref().and_then(PowerMode::parse) {
            if let Err(err) = self.set_power_mode(saved).await {
                warn!("Could not restore power mode: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn sent_fan_commands(sent: &[Vec<u8>]) -> Vec<(u8, Vec<u8>)> {
        sent.iter()
            .filter(|buf| buf[6] == 0x0D)
            .map(|buf| (buf[7], buf[8..12].to_vec()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_mode_swap_preserves_fan() {
        let (device, endpoint) = testing::laptop_device();
        device.prime_serial("BLADE");
        let system = device.system_control().unwrap();

        {
            let mut ep = endpoint.lock();
            // fan 0: balanced, 4000 RPM
            ep.queue_ok(0x0D, 0x82, 0x1F, &[0x00, 0x00, 0x00, 0x28]);
            // SET fan 0 echo
            // (mock synthesizes it)
        }

        assert!(system.set_power_mode(PowerMode::Gaming).await.unwrap());

        let cmds = sent_fan_commands(&endpoint.lock().sent);
        // GET fan0, SET fan0, GET fan1, SET fan1 (dual fan model)
        assert_eq!(cmds[0].0, 0x82);
        assert_eq!(cmds[1].0, 0x02);
        assert_eq!(cmds[1].1, vec![0x00, 0x00, 0x01, 0x28]);
        assert_eq!(cmds[2].0, 0x82);
        assert_eq!(cmds[3].0, 0x02);
        assert_eq!(cmds[3].1[1], 0x01);
        assert_eq!(cmds[3].1[2], 0x01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_rpm_validation() {
        let (device, _) = testing::laptop_device();
        device.prime_serial("BLADE");
        let system = device.system_control().unwrap();

        let err = system.set_fan_rpm(1000, None).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));

        let err = system.set_fan_rpm(9000, None).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpm_zero_bypasses_validation() {
        let (device, endpoint) = testing::laptop_device();
        device.prime_serial("BLADE");
        let system = device.system_control().unwrap();

        // cached power mode so set_fan_auto issues no GETs
        system.cache.lock().power_mode = Some(PowerMode::Balanced);

        assert!(system.set_fan_rpm(0, None).await.unwrap());

        let cmds = sent_fan_commands(&endpoint.lock().sent);
        assert!(cmds.iter().all(|(id, _)| *id == 0x02));
        assert_eq!(cmds[0].1, vec![0x00, 0x00, 0x00, 0x00]);
        // dual fan: both programmed
        assert_eq!(cmds[1].1, vec![0x00, 0x01, 0x00, 0x00]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_fan_rpm_dual() {
        let (device, endpoint) = testing::laptop_device();
        device.prime_serial("BLADE");
        let system = device.system_control().unwrap();
        system.cache.lock().power_mode = Some(PowerMode::Custom);

        assert!(system.set_fan_rpm(4000, Some(4500)).await.unwrap());

        let cmds = sent_fan_commands(&endpoint.lock().sent);
        assert_eq!(cmds[0].1, vec![0x00, 0x00, 0x04, 0x28]);
        assert_eq!(cmds[1].1, vec![0x00, 0x01, 0x04, 0x2D]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_coalesced() {
        let (device, endpoint) = testing::laptop_device();
        device.prime_serial("BLADE");
        let system = device.system_control().unwrap();

        system.power_mode().await;
        let first_count = endpoint.lock().sent.len();
        assert!(first_count > 0);

        // within the refresh window: no extra traffic
        system.fan_rpm().await;
        assert_eq!(endpoint.lock().sent.len(), first_count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_boost_gated_by_capability() {
        let (device, endpoint) = testing::laptop_device();
        device.prime_serial("BLADE");
        let system = device.system_control().unwrap();

        assert!(system.set_cpu_boost(BoostMode::High).await.unwrap());
        let cmds: Vec<_> = endpoint
            .lock()
            .sent
            .iter()
            .filter(|b| b[6] == 0x0D && b[7] == 0x0D)
            .cloned()
            .collect();
        assert_eq!(cmds.len(), 1);
        assert_eq!(&cmds[0][8..11], &[0x01, 0x00, 0x02]);
    }
}
