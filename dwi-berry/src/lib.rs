#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 基于粒子模型的全局纤维追踪 (global tractography, GT) 的 MCMC 采样核心.
//!
//! 该 crate 目前仅提供 `safe` 接口. 粒子图使用 arena + 索引的方式存储,
//! 不存在悬垂指针.
//!
//! # 注意
//!
//! 1. 该 crate 不负责扩散信号的物理建模, 组织响应矩阵由调用方预先计算后注入.
//! 2. 在非期望情况下 (例如粒子图拓扑被破坏), 程序返回错误而不是静默地产出错误结果.
//!
//! # 开发计划
//!
//! ### 粒子与粒子池 ✅
//!
//! 粒子的前驱/后继连接始终双向对称, 死亡粒子的槽位复用.
//!
//! 实现位于 `dwi-berry/src/gt/particle.rs`.
//!
//! ### 粒子空间网格 ✅
//!
//! 单元边长 `2L`, 邻居查询只需检查少量单元.
//!
//! 实现位于 `dwi-berry/src/gt/grid.rs`.
//!
//! ### 内部能量 & 外部能量 ✅
//!
//! 1. 内部能量: 奖励共线, 首尾相接的粒子链. ✅
//! 2. 外部能量: 粒子 TOD 与各向同性分量对 DWI 信号的拟合残差. ✅
//! 3. 按 `lam_int`, `lam_ext` 加权求和. ✅
//!
//! 实现位于 `dwi-berry/src/gt/energy/*`.
//!
//! ### 退火控制 ✅
//!
//! 预热, 降温, 冻结三个阶段. 降温结束时 `Tint` 严格等于 `T1`.
//!
//! 实现位于 `dwi-berry/src/gt/stats.rs`.
//!
//! ### Metropolis-Hastings 采样 ✅
//!
//! 出生, 死亡, 随机平移, 最优平移, 连接五类提议. 多线程运行.
//!
//! 实现位于 `dwi-berry/src/gt/sampler.rs`.
//!
//! ### 纤维束导出 ✅
//!
//! 沿前驱/后继链遍历, 输出折线.
//!
//! 实现位于 `dwi-berry/src/gt/tracks.rs`.
//!
//! ### 按体素的细粒度锁 ⌛️
//!
//! 目前采样器对 "提议-评估-提交" 整体加锁.

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 扫描仪坐标系下的点或方向 (毫米).
pub type Point = nalgebra::Vector3<f64>;

/// nii 文件基础数据结构.
pub mod data;

pub use data::{DwiImage, MaskImage, NiftiHeaderAttr, VolumeGeometry};

pub mod consts;

pub mod gt;

pub mod sh;

pub mod prelude;
