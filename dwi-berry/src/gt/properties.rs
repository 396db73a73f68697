//! 采样参数.

use ndarray::{Array1, Array2};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::error::ConfigError;
use super::stats::MoveKind;
use crate::consts::anneal::{DEFAULT_MAX_ITER, DEFAULT_T0, DEFAULT_T1};
use crate::consts::MAX_LMAX;
use crate::sh;

/// 采样期间只读的模型参数.
///
/// 组织响应矩阵由调用方预先估计后填入. `resp_wm` 为空矩阵时不能计算外部能量.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Properties {
    /// 粒子半长 `L` (毫米).
    pub length: f64,

    /// 出生提议概率.
    pub p_birth: f64,

    /// 死亡提议概率.
    pub p_death: f64,

    /// 随机平移提议概率.
    pub p_shift: f64,

    /// 最优平移提议概率.
    pub p_optshift: f64,

    /// 连接提议概率.
    pub p_connect: f64,

    /// 期望粒子密度 (每立方毫米).
    pub density: f64,

    /// 单个粒子对 fODF 的贡献权重.
    pub weight: f64,

    /// 球谐最大阶数 (偶数).
    pub lmax: u32,

    /// 外部能量权重.
    pub lam_ext: f64,

    /// 内部能量权重.
    pub lam_int: f64,

    /// 各向同性分量的正则化系数.
    pub beta: f64,

    /// 粒子势能, 每个粒子的固定代价.
    pub ppot: f64,

    /// 连接势能, 每条连接的固定奖励.
    pub cpot: f64,

    /// 白质响应, 形状 `(n_dwi, n_sh)`.
    pub resp_wm: Array2<f32>,

    /// 各向同性组织响应, 每个长度为 `n_dwi`.
    pub resp_iso: Vec<Array1<f32>>,
}

impl Default for Properties {
    fn default() -> Self {
        Self {
            length: 1.0,
            p_birth: 0.25,
            p_death: 0.05,
            p_shift: 0.25,
            p_optshift: 0.10,
            p_connect: 0.35,
            density: 1.0,
            weight: 0.1,
            lmax: 8,
            lam_ext: 1.0,
            lam_int: 1.0,
            beta: 0.0,
            ppot: 0.05,
            cpot: 1.0,
            resp_wm: Array2::zeros((0, 0)),
            resp_iso: Vec::new(),
        }
    }
}

impl Properties {
    /// 球谐系数个数.
    #[inline]
    pub fn n_sh(&self) -> usize {
        sh::n_for_lmax(self.lmax)
    }

    /// 五类提议的概率, 顺序同 [`MoveKind::ALL`].
    #[inline]
    pub fn proposal_probabilities(&self) -> [f64; 5] {
        [
            self.p_birth,
            self.p_death,
            self.p_shift,
            self.p_optshift,
            self.p_connect,
        ]
    }

    /// 按累积概率将 `[0, 1)` 上的均匀随机数 `u` 映射为提议类型.
    pub fn pick_move(&self, u: f64) -> MoveKind {
        let mut acc = 0.0;
        for (k, p) in MoveKind::ALL.into_iter().zip(self.proposal_probabilities()) {
            acc += p;
            if u < acc {
                return k;
            }
        }
        MoveKind::Connect
    }

    /// 检查模型参数 (不含与 DWI 体积数相关的部分).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let names = ["p_birth", "p_death", "p_shift", "p_optshift", "p_connect"];
        let probs = self.proposal_probabilities();
        for (name, p) in names.into_iter().zip(probs) {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Probability(name, p));
            }
        }
        let sum: f64 = probs.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::ProbabilitySum(sum));
        }

        for (name, v) in [
            ("length", self.length),
            ("density", self.density),
            ("weight", self.weight),
        ] {
            if !(v.is_finite() && v > 0.0) {
                return Err(ConfigError::NotPositive(name, v));
            }
        }
        for (name, v) in [
            ("lam_ext", self.lam_ext),
            ("lam_int", self.lam_int),
            ("beta", self.beta),
            ("ppot", self.ppot),
            ("cpot", self.cpot),
        ] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(ConfigError::Negative(name, v));
            }
        }

        if self.lmax % 2 != 0 {
            return Err(ConfigError::OddLmax(self.lmax));
        }
        if self.lmax > MAX_LMAX {
            return Err(ConfigError::ResponseShape(format!(
                "lmax = {} exceeds the supported maximum {MAX_LMAX}",
                self.lmax
            )));
        }

        if self.resp_wm.is_empty() {
            if !self.resp_iso.is_empty() {
                return Err(ConfigError::ResponseShape(
                    "isotropic responses given without a white matter response".to_string(),
                ));
            }
            return Ok(());
        }
        if self.resp_wm.ncols() != self.n_sh() {
            return Err(ConfigError::ResponseShape(format!(
                "resp_wm has {} columns, lmax = {} needs {}",
                self.resp_wm.ncols(),
                self.lmax,
                self.n_sh()
            )));
        }
        let n_dwi = self.resp_wm.nrows();
        if let Some(r) = self.resp_iso.iter().find(|r| r.len() != n_dwi) {
            return Err(ConfigError::ResponseShape(format!(
                "resp_iso has length {}, resp_wm has {n_dwi} rows",
                r.len()
            )));
        }
        Ok(())
    }

    /// 在 [`Properties::validate`] 之外, 检查响应矩阵与 DWI 体积数 `n_dwi` 是否一致.
    pub fn validate_for(&self, n_dwi: usize) -> Result<(), ConfigError> {
        self.validate()?;
        if self.resp_wm.nrows() != n_dwi {
            return Err(ConfigError::ResponseShape(format!(
                "resp_wm has {} rows, the image has {n_dwi} volumes",
                self.resp_wm.nrows()
            )));
        }
        Ok(())
    }
}

/// 退火与运行设置.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AnnealConfig {
    /// 初始内部温度.
    pub t0: f64,

    /// 最终内部温度, 同时也是外部温度.
    pub t1: f64,

    /// 最大迭代次数 (所有线程合计).
    pub max_iter: usize,

    /// 工作线程数.
    pub threads: usize,

    /// 随机种子. 第 `i` 个线程使用 `seed + i`.
    pub seed: u64,
}

impl Default for AnnealConfig {
    fn default() -> Self {
        Self {
            t0: DEFAULT_T0,
            t1: DEFAULT_T1,
            max_iter: DEFAULT_MAX_ITER,
            threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            seed: 0,
        }
    }
}

impl AnnealConfig {
    /// 检查设置.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, v) in [("t0", self.t0), ("t1", self.t1)] {
            if !(v.is_finite() && v > 0.0) {
                return Err(ConfigError::NotPositive(name, v));
            }
        }
        if self.max_iter == 0 {
            return Err(ConfigError::NoIterations);
        }
        if self.threads == 0 {
            return Err(ConfigError::NotPositive("threads", 0.0));
        }
        Ok(())
    }
}
