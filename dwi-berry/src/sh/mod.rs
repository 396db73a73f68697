//! 偶数阶实球谐函数.
//!
//! 系数按 `l(l+1)/2 + m` 排列, 只包含偶数阶 `l = 0, 2, ..., lmax`, `-l <= m <= l`.
//! `m > 0` 对应 `cos(m * phi)` 分量, `m < 0` 对应 `sin(|m| * phi)` 分量.

mod legendre;

use legendre::ShImp;

/// `lmax` 阶 (偶数) 球谐展开的系数个数.
#[inline]
pub const fn n_for_lmax(lmax: u32) -> usize {
    let l = lmax as usize;
    (l + 1) * (l + 2) / 2
}

/// 由系数个数反推最大阶数. `n` 不合法时返回 `None`.
pub fn lmax_for_n(n: usize) -> Option<u32> {
    (0..=crate::consts::MAX_LMAX)
        .step_by(2)
        .find(|&l| n_for_lmax(l) == n)
}

/// 系数 `(l, m)` 的下标. `l` 必须为偶数.
#[inline]
pub const fn index(l: u32, m: i32) -> usize {
    let l = l as isize;
    (l * (l + 1) / 2 + m as isize) as usize
}

/// 各球谐基在方向 `dir` 处的值, 即该方向上狄拉克函数的 (未归一化) 球谐系数.
///
/// `dir` 不必是单位向量; 零向量视为 `z` 轴.
pub fn delta_f32(dir: [f32; 3], lmax: u32) -> Vec<f32> {
    ShImp::<f32>::new(lmax).delta(dir)
}

/// 各球谐基在方向 `dir` 处的值, 即该方向上狄拉克函数的 (未归一化) 球谐系数.
///
/// `dir` 不必是单位向量; 零向量视为 `z` 轴.
pub fn delta_f64(dir: [f64; 3], lmax: u32) -> Vec<f64> {
    ShImp::<f64>::new(lmax).delta(dir)
}

/// 以 `coefs` 为系数的球谐函数在 `dir` 处的值. `lmax` 由系数个数推出.
///
/// # 注意
///
/// `coefs.len()` 必须是某个偶数阶的系数个数, 否则 panic.
pub fn value_f32(coefs: &[f32], dir: [f32; 3]) -> f32 {
    let Some(lmax) = lmax_for_n(coefs.len()) else {
        panic!("非法的球谐系数个数: {}", coefs.len());
    };
    ShImp::<f32>::new(lmax).value(coefs, dir)
}

/// 以 `coefs` 为系数的球谐函数在 `dir` 处的值. `lmax` 由系数个数推出.
///
/// # 注意
///
/// `coefs.len()` 必须是某个偶数阶的系数个数, 否则 panic.
pub fn value_f64(coefs: &[f64], dir: [f64; 3]) -> f64 {
    let Some(lmax) = lmax_for_n(coefs.len()) else {
        panic!("非法的球谐系数个数: {}", coefs.len());
    };
    ShImp::<f64>::new(lmax).value(coefs, dir)
}
