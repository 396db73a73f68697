//! 通用常量.

/// 退火日程.
pub mod anneal {
    /// 预热阶段占总迭代次数的比例. 该阶段内 `Tint` 保持为 `T0`.
    pub const FRACTION_BURNIN: f64 = 0.1;

    /// 冻结阶段占总迭代次数的比例. 该阶段内 `Tint` 保持为 `T1`.
    pub const FRACTION_PHASEOUT: f64 = 0.1;

    /// 每个大步包含的迭代次数上限.
    pub const MAX_BIGSTEP: usize = 10_000;

    /// 默认初始内部温度.
    pub const DEFAULT_T0: f64 = 0.1;

    /// 默认最终内部温度, 同时也是外部温度.
    pub const DEFAULT_T1: f64 = 0.001;

    /// 默认最大迭代次数.
    pub const DEFAULT_MAX_ITER: usize = 10_000_000;
}

/// 随机平移提议.
pub mod shift {
    /// 位置扰动标准差, 以粒子半长 `L` 为单位.
    pub const SIGMA_POS_FRAC: f64 = 0.125;

    /// 方向扰动标准差 (单位向量各分量).
    pub const SIGMA_DIR: f64 = 0.2;
}

/// 支持的最大球谐阶数.
pub const MAX_LMAX: u32 = 16;
