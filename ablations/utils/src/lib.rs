//! 消融实验依赖的通用组件.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

pub mod phantom;

const SEP: &str = "--------------------------------------------------------";

/// 简单分隔线.
#[inline]
pub fn sep() {
    println!("{SEP}");
}

/// 简单分隔线.
#[inline]
pub fn sep_to<W: std::io::Write>(mut w: W) {
    writeln!(&mut w, "{SEP}").unwrap();
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

/// 读取环境变量 `key` 并解析. 变量不存在或无法解析时返回 `default`.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// 迭代次数.
///
/// 1. 若环境变量 `$GT_NITER` 可解析, 则返回其值;
/// 2. 否则, 返回 `default`.
#[inline]
pub fn niter_from_env_or(default: usize) -> usize {
    env_or("GT_NITER", default)
}

/// 每组实验的工作线程数.
///
/// 1. 若环境变量 `$GT_THREADS` 可解析, 则返回其值;
/// 2. 否则, 返回 `default`.
#[inline]
pub fn threads_from_env_or(default: usize) -> usize {
    env_or("GT_THREADS", default).max(1)
}

/// 采样统计日志所在目录. 若环境变量 `$GT_STATS_LOG` 为空, 则不写日志.
pub fn stats_log_dir_from_env() -> Option<PathBuf> {
    env::var_os("GT_STATS_LOG")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
