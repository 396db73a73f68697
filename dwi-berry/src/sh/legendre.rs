//! 归一化连带勒让德函数与实球谐基.

// ref: Holmes & Featherstone (2002), 归一化勒让德函数的稳定递推.

use std::marker::PhantomData;

use once_cell::sync::Lazy;

use super::{index, n_for_lmax};
use crate::consts::MAX_LMAX;

const FOUR_PI: f64 = 4.0 * std::f64::consts::PI;

/// 递推系数表, 按 `l * (MAX_LMAX + 1) + m` 存储 `(a_lm, b_lm)`:
///
/// `P(l, m) = a_lm * (x * P(l-1, m) - b_lm * P(l-2, m))`.
static RECURRENCE: Lazy<Vec<(f64, f64)>> = Lazy::new(|| {
    let n = MAX_LMAX as usize + 1;
    let mut table = vec![(0.0, 0.0); n * n];
    for l in 2..n {
        for m in 0..(l - 1) {
            let (lf, mf) = (l as f64, m as f64);
            let a = ((4.0 * lf * lf - 1.0) / (lf * lf - mf * mf)).sqrt();
            let b = (((lf - 1.0) * (lf - 1.0) - mf * mf) / (4.0 * (lf - 1.0) * (lf - 1.0) - 1.0))
                .sqrt();
            table[l * n + m] = (a, b);
        }
    }
    table
});

pub(crate) struct ShImp<T: num::Float> {
    lmax: u32,
    _t: PhantomData<T>,
}

macro_rules! impl_sh {
    ($fp: ty) => {
        impl ShImp<$fp> {
            #[inline]
            pub fn new(lmax: u32) -> Self {
                assert!(lmax % 2 == 0, "球谐阶数必须为偶数");
                assert!(lmax <= MAX_LMAX, "球谐阶数过大");
                Self {
                    lmax,
                    _t: PhantomData,
                }
            }

            /// 所有偶数阶实球谐基在 `dir` 处的值.
            pub fn delta(&self, dir: [$fp; 3]) -> Vec<$fp> {
                let [x, y, z] = dir;
                let norm = (x * x + y * y + z * z).sqrt();
                let (x, y, z) = if norm > 0.0 {
                    (x / norm, y / norm, z / norm)
                } else {
                    (0.0, 0.0, 1.0)
                };
                let phi = y.atan2(x);
                let plm = self.legendre(z);

                let n = MAX_LMAX as usize + 1;
                let mut out = vec![0.0; n_for_lmax(self.lmax)];
                let sqrt2 = (2.0 as $fp).sqrt();
                for l in (0..=self.lmax as usize).step_by(2) {
                    out[index(l as u32, 0)] = plm[l * n];
                    for m in 1..=l {
                        let p = sqrt2 * plm[l * n + m];
                        let (s, c) = (m as $fp * phi).sin_cos();
                        out[index(l as u32, m as i32)] = p * c;
                        out[index(l as u32, -(m as i32))] = p * s;
                    }
                }
                out
            }

            /// 以 `coefs` 为系数的球谐函数在 `dir` 处的值.
            pub fn value(&self, coefs: &[$fp], dir: [$fp; 3]) -> $fp {
                self.delta(dir)
                    .iter()
                    .zip(coefs)
                    .fold(0.0, |acc, (y, c)| acc + y * c)
            }

            /// 归一化连带勒让德函数 `P(l, m)(x)`, `0 <= m <= l <= lmax`,
            /// 按 `l * (MAX_LMAX + 1) + m` 存储. 不含 Condon-Shortley 相位.
            fn legendre(&self, x: $fp) -> Vec<$fp> {
                let n = MAX_LMAX as usize + 1;
                let lmax = self.lmax as usize;
                let s = (1.0 - x * x).max(0.0).sqrt();
                let mut p = vec![0.0; n * n];

                p[0] = (1.0 / FOUR_PI).sqrt() as $fp;
                for m in 1..=lmax {
                    let k = ((2 * m + 1) as $fp / (2 * m) as $fp).sqrt();
                    p[m * n + m] = k * s * p[(m - 1) * n + (m - 1)];
                }
                for m in 0..lmax {
                    p[(m + 1) * n + m] = ((2 * m + 3) as $fp).sqrt() * x * p[m * n + m];
                }
                for l in 2..=lmax {
                    for m in 0..(l - 1) {
                        let (a, b) = RECURRENCE[l * n + m];
                        p[l * n + m] = a as $fp
                            * (x * p[(l - 1) * n + m] - b as $fp * p[(l - 2) * n + m]);
                    }
                }
                p
            }
        }
    };
}

impl_sh!(f32);
impl_sh!(f64);
