//! 运行时错误.

use super::ParticleId;

/// 粒子图拓扑错误. 出现该错误意味着追踪结果已经不可信.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// 粒子 id 不存在, 或对应粒子已经死亡.
    #[error("particle {0:?} does not exist or is not alive")]
    DeadParticle(ParticleId),

    /// 端点编号只能是 `-1` 或 `+1`.
    #[error("invalid particle end {0}, expected -1 or +1")]
    InvalidEnd(i32),

    /// 要移除的连接不存在. 第二个参数为端点编号.
    #[error("particle {0:?} has no link at end {1}")]
    MissingLink(ParticleId, i32),

    /// 连接不对称: 邻居没有指回该粒子.
    #[error("link {0:?} -> {1:?} is not reciprocal")]
    NotReciprocal(ParticleId, ParticleId),

    /// 端点已被占用, 需要先断开.
    #[error("particle {0:?} end {1} is already linked")]
    EndOccupied(ParticleId, i32),

    /// 粒子不能连接到自身.
    #[error("particle {0:?} cannot be linked to itself")]
    SelfLink(ParticleId),

    /// 两个粒子之间只允许存在一条连接.
    #[error("particles {0:?} and {1:?} are already linked")]
    DoubleLink(ParticleId, ParticleId),
}

/// 配置错误. 在采样开始前检查.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// 各类提议概率之和必须为 1. 参数为实际和.
    #[error("proposal probabilities sum to {0}, expected 1")]
    ProbabilitySum(f64),

    /// 单个提议概率不在 `[0, 1]` 内.
    #[error("proposal probability `{0}` = {1} is out of [0, 1]")]
    Probability(&'static str, f64),

    /// 参数必须为有限正数.
    #[error("`{0}` = {1} must be finite and positive")]
    NotPositive(&'static str, f64),

    /// 参数必须为有限非负数.
    #[error("`{0}` = {1} must be finite and non-negative")]
    Negative(&'static str, f64),

    /// 球谐阶数必须为偶数.
    #[error("lmax = {0} must be even")]
    OddLmax(u32),

    /// 响应矩阵形状与 `lmax` 或 DWI 体积数不一致.
    #[error("response shape mismatch: {0}")]
    ResponseShape(String),

    /// 迭代次数必须大于零.
    #[error("maximum iteration count must be positive")]
    NoIterations,

    /// 掩膜中没有任何体素.
    #[error("sampling mask is empty")]
    EmptyMask,
}

/// 全局追踪运行时错误.
#[derive(Debug, thiserror::Error)]
pub enum GtError {
    /// 配置错误.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 粒子图拓扑被破坏.
    #[error("broken track topology: {0}")]
    Topology(#[from] TopologyError),

    /// 位置 (扫描仪坐标, 毫米) 超出粒子网格范围.
    #[error("position ({0:.3}, {1:.3}, {2:.3}) is outside the particle grid")]
    OutOfBounds(f64, f64, f64),

    /// 读取 nifti 文件错误.
    #[error(transparent)]
    Nifti(#[from] nifti::NiftiError),

    /// 图像维度不符合要求.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    /// 底层 I/O 错误.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// 写入 npy 文件错误.
    #[error(transparent)]
    WriteNpy(#[from] ndarray_npy::WriteNpyError),
}
