//! 能量计算.
//!
//! 每个工作线程持有自己的能量计算器实例 (内部暂存区与随机数发生器互不共享),
//! 只共享 [`Stats`]. 计算器只 "暂存" 一次提议带来的能量变化,
//! 被接受后再通过 [`EnergyComputer::accept_changes`] 提交.
//!
//! 所有 `stage_*` 方法返回已经除以对应温度的 `ΔE / T`, 调用方可直接取指数.

mod external;
mod internal;

use std::sync::Arc;

pub use external::{ExternalEnergyComputer, ExternalField};
pub use internal::InternalEnergyComputer;

use super::particle::{ParticleEnd, ParticleId};
use super::properties::Properties;
use super::stats::Stats;
use super::{GtResult, GtState};
use crate::Point;

/// 能量计算器.
pub trait EnergyComputer: Send {
    /// 在 `pos` 处新增方向为 `dir` (单位向量) 的粒子带来的 `ΔE / T`.
    fn stage_add(&mut self, state: &GtState, pos: &Point, dir: &Point) -> GtResult<f64>;

    /// 将粒子 `par` 移动到 `pos`, 方向改为 `dir` (单位向量) 带来的 `ΔE / T`.
    fn stage_shift(
        &mut self,
        state: &GtState,
        par: ParticleId,
        pos: &Point,
        dir: &Point,
    ) -> GtResult<f64>;

    /// 删除粒子 `par` (连同其全部连接) 带来的 `ΔE / T`.
    fn stage_remove(&mut self, state: &GtState, par: ParticleId) -> GtResult<f64>;

    /// 为端点 `pe1` 选择新的连接对象, 写入 `pe2`, 返回重连带来的 `ΔE / T`.
    ///
    /// 返回后 `pe2.p_suc` 为选中 `pe2` 的提议概率,
    /// `pe1.p_suc` 为反向提议 (恢复原连接) 的概率.
    /// 不负责选择端点的计算器不修改 `pe2`.
    fn stage_connect(
        &mut self,
        state: &GtState,
        pe1: &mut ParticleEnd,
        pe2: &mut ParticleEnd,
    ) -> GtResult<f64>;

    /// 提交暂存的变化: 累加能量统计, 必要时更新 `state` 中的能量场.
    fn accept_changes(&mut self, state: &mut GtState);

    /// 丢弃暂存的变化.
    fn clear_changes(&mut self);

    /// 当前状态的总能量 (未除以温度).
    fn eval(&self, state: &GtState) -> f64;
}

/// 加权求和: `sum(lam_i * E_i)`.
#[derive(Default)]
pub struct EnergySumComputer {
    parts: Vec<(f64, Box<dyn EnergyComputer>)>,
}

impl EnergySumComputer {
    /// 空的加权和.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一项, 权重为 `lam`. 连接提议由第一个负责选择端点的计算器决定.
    pub fn with(mut self, lam: f64, computer: Box<dyn EnergyComputer>) -> Self {
        self.parts.push((lam, computer));
        self
    }

    /// 内部能量 (权重 `lam_int`) 与外部能量 (权重 `lam_ext`) 之和.
    ///
    /// `seed` 用于内部能量计算器选择连接端点.
    pub fn from_properties(stats: Arc<Stats>, props: &Properties, seed: u64) -> Self {
        Self::new()
            .with(
                props.lam_int,
                Box::new(InternalEnergyComputer::new(Arc::clone(&stats), props, seed)),
            )
            .with(
                props.lam_ext,
                Box::new(ExternalEnergyComputer::new(stats, props)),
            )
    }

    /// 项数.
    #[inline]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn sum<F>(&mut self, mut f: F) -> GtResult<f64>
    where
        F: FnMut(&mut dyn EnergyComputer) -> GtResult<f64>,
    {
        let mut de = 0.0;
        for (lam, c) in self.parts.iter_mut() {
            de += *lam * f(c.as_mut())?;
        }
        Ok(de)
    }
}

impl std::fmt::Debug for EnergySumComputer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnergySumComputer")
            .field("lam", &self.parts.iter().map(|p| p.0).collect::<Vec<_>>())
            .finish()
    }
}

impl EnergyComputer for EnergySumComputer {
    fn stage_add(&mut self, state: &GtState, pos: &Point, dir: &Point) -> GtResult<f64> {
        self.sum(|c| c.stage_add(state, pos, dir))
    }

    fn stage_shift(
        &mut self,
        state: &GtState,
        par: ParticleId,
        pos: &Point,
        dir: &Point,
    ) -> GtResult<f64> {
        self.sum(|c| c.stage_shift(state, par, pos, dir))
    }

    fn stage_remove(&mut self, state: &GtState, par: ParticleId) -> GtResult<f64> {
        self.sum(|c| c.stage_remove(state, par))
    }

    fn stage_connect(
        &mut self,
        state: &GtState,
        pe1: &mut ParticleEnd,
        pe2: &mut ParticleEnd,
    ) -> GtResult<f64> {
        self.sum(|c| c.stage_connect(state, pe1, pe2))
    }

    fn accept_changes(&mut self, state: &mut GtState) {
        for (_, c) in self.parts.iter_mut() {
            c.accept_changes(state);
        }
    }

    fn clear_changes(&mut self) {
        for (_, c) in self.parts.iter_mut() {
            c.clear_changes();
        }
    }

    fn eval(&self, state: &GtState) -> f64 {
        self.parts.iter().map(|(lam, c)| lam * c.eval(state)).sum()
    }
}
