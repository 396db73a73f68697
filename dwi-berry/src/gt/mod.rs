//! 全局纤维追踪的粒子 MCMC 核心.
//!
//! 纤维束由大量短线段 (粒子) 表示. 采样器反复提出出生, 死亡, 平移与连接等扰动,
//! 按照内部能量 (平滑先验) 与外部能量 (数据拟合) 的变化做 Metropolis-Hastings
//! 接受/拒绝, 同时以模拟退火的方式逐步降低内部温度.
//!
//! # 示例
//!
//! ```no_run
//! use dwi_berry::gt::{AnnealConfig, MhSampler, Properties};
//! use dwi_berry::{DwiImage, MaskImage};
//!
//! let dwi = DwiImage::open("dwi.nii.gz").unwrap();
//! let mask = MaskImage::open("mask.nii.gz").unwrap();
//! let props = Properties::default(); // resp_wm / resp_iso 需要由调用方填入
//! let cfg = AnnealConfig::default();
//!
//! let (mut state, stats) = MhSampler::run_on_image(&dwi, &mask, &props, &cfg).unwrap();
//! let tracks = dwi_berry::gt::export_tracks(&mut state.grid, 2).unwrap();
//! println!("{} tracks, Tint = {}", tracks.len(), stats.tint());
//! ```

mod error;

pub mod energy;
pub mod grid;
pub mod particle;
pub mod properties;
pub mod sampler;
pub mod stats;
pub mod tracks;

#[cfg(test)]
mod testing;

pub use energy::{
    EnergyComputer, EnergySumComputer, ExternalEnergyComputer, ExternalField,
    InternalEnergyComputer,
};
pub use error::{ConfigError, GtError, TopologyError};
pub use grid::ParticleGrid;
pub use particle::{Particle, ParticleEnd, ParticleId, ParticlePool};
pub use properties::{AnnealConfig, Properties};
pub use sampler::{MhSampler, SamplingDomain};
pub use stats::{MoveKind, Stats, StatsSnapshot};
pub use tracks::{export_tracks, Track};

/// 全局追踪的运行时结果.
pub type GtResult<T> = Result<T, GtError>;

/// 采样器共享的可变状态: 粒子网格与外部能量场.
///
/// 所有工作线程通过同一把锁访问它, 一次 "提议-评估-提交" 在锁内完成.
#[derive(Debug)]
pub struct GtState {
    /// 粒子网格 (同时拥有粒子池).
    pub grid: ParticleGrid,

    /// 外部能量场. 为 `None` 时外部能量恒为零.
    pub field: Option<ExternalField>,
}

impl GtState {
    /// 只包含粒子网格, 不计算外部能量.
    #[inline]
    pub fn new(grid: ParticleGrid) -> Self {
        Self { grid, field: None }
    }

    /// 同时携带外部能量场.
    #[inline]
    pub fn with_field(grid: ParticleGrid, field: ExternalField) -> Self {
        Self {
            grid,
            field: Some(field),
        }
    }
}
