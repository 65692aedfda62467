use anyhow::{anyhow, Context, Result};
use areadet_core::device::DeviceInfo;
use areadet_core::interface::HwInterface;

/// 设备族枚举，由设备 ID 的前缀决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Simulation,
}

impl BackendType {
    pub fn from_id(id: &str) -> Option<Self> {
        let (prefix, _) = id.split_once(':')?;
        match prefix {
            "sim" => Some(Self::Simulation),
            _ => None,
        }
    }

    /// 当前编译进来的设备族
    pub fn available() -> Vec<BackendType> {
        #[allow(unused_mut)]
        let mut backends = Vec::new();
        #[cfg(feature = "simulation")]
        backends.push(BackendType::Simulation);
        backends
    }
}

/// 枚举所有已编译设备族的设备
pub fn list_devices() -> Vec<DeviceInfo> {
    BackendType::available()
        .into_iter()
        .flat_map(|backend| match backend {
            #[cfg(feature = "simulation")]
            BackendType::Simulation => {
                areadet_simulation::list_devices(&areadet_simulation::SimConfig::default())
            }
            #[cfg(not(feature = "simulation"))]
            BackendType::Simulation => Vec::new(),
        })
        .collect()
}

/// 按设备 ID 打开探测器 (例如 "sim:0")
pub fn open_detector(id: &str) -> Result<HwInterface> {
    let backend =
        BackendType::from_id(id).ok_or_else(|| anyhow!("Unknown detector family for id {:?}", id))?;

    match backend {
        #[cfg(feature = "simulation")]
        BackendType::Simulation => {
            open_simulation(id, areadet_simulation::SimConfig::default())
        }
        #[cfg(not(feature = "simulation"))]
        BackendType::Simulation => Err(anyhow!(
            "Simulation backend not compiled in. Please check Cargo features."
        )),
    }
}

/// 用指定配置打开模拟探测器
#[cfg(feature = "simulation")]
pub fn open_simulation(id: &str, config: areadet_simulation::SimConfig) -> Result<HwInterface> {
    let cam = areadet_simulation::open(id, config)
        .with_context(|| format!("Failed to open detector {}", id))?;
    Ok(cam.into_hw())
}

#[cfg(all(test, feature = "simulation"))]
mod tests {
    use super::*;

    #[test]
    fn ids_select_backend() {
        assert_eq!(BackendType::from_id("sim:2"), Some(BackendType::Simulation));
        assert_eq!(BackendType::from_id("espia:0"), None);
        assert_eq!(BackendType::from_id("sim"), None);
    }

    #[test]
    fn open_known_and_unknown_devices() {
        assert_eq!(list_devices().len(), 4);
        let hw = open_detector("sim:1").unwrap();
        assert_eq!(hw.name(), "sim:1");
        assert!(open_detector("sim:7").is_err());
        assert!(open_detector("pco:0").is_err());
    }
}
