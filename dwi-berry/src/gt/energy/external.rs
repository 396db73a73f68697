//! 外部能量: 粒子构成的轨迹方向分布 (TOD) 对 DWI 信号的拟合残差.
//!
//! 每个粒子以三线性权重将 `weight * Y(dir)` 累加到周围 8 个体素的 TOD 上.
//! 体素的预测信号为 `resp_wm * tod`, 残差再依次扣除各向同性分量
//! (带 `beta` 正则的非负投影), 体素能量为残差平方均值.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView1, ArrayView3, ArrayView4};

use super::EnergyComputer;
use crate::data::{DwiImage, MaskImage, NiftiHeaderAttr, VolumeGeometry};
use crate::gt::error::ConfigError;
use crate::gt::particle::{ParticleEnd, ParticleId};
use crate::gt::properties::Properties;
use crate::gt::stats::Stats;
use crate::gt::{GtResult, GtState};
use crate::{sh, Idx3d, Point};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
    }
}

/// 单个体素的拟合结果.
#[derive(Debug, Clone)]
struct VoxelFit {
    voxel: Idx3d,
    tod: Array1<f32>,
    fiso: Array1<f32>,
    energy: f64,
}

/// 外部能量场: DWI 信号, 当前 TOD, 各向同性分量与逐体素能量.
///
/// 由采样器的状态锁保护, 只在提议被接受时修改.
#[derive(Debug, Clone)]
pub struct ExternalField {
    geometry: VolumeGeometry,
    lmax: u32,
    beta: f64,
    resp_wm: Array2<f64>,
    resp_iso: Vec<Array1<f64>>,
    dwi: Array4<f32>,
    mask: Array3<bool>,
    voxels: Vec<Idx3d>,
    tod: Array4<f32>,
    fiso: Array4<f32>,
    energy: Array3<f64>,
}

impl ExternalField {
    /// 由 DWI, 掩膜与模型参数建立能量场, TOD 初始为零.
    pub fn new(dwi: &DwiImage, mask: &MaskImage, props: &Properties) -> GtResult<Self> {
        props.validate_for(dwi.len_volumes())?;
        if props.resp_wm.is_empty() {
            return Err(ConfigError::ResponseShape(
                "external energy needs a white matter response".to_string(),
            )
            .into());
        }
        if mask.shape() != dwi.shape() {
            return Err(
                ndarray::ShapeError::from_kind(ndarray::ErrorKind::IncompatibleShape).into(),
            );
        }

        let (x, y, z) = dwi.shape();
        let n_sh = props.n_sh();
        let n_iso = props.resp_iso.len();
        let mut field = Self {
            geometry: dwi.geometry(),
            lmax: props.lmax,
            beta: props.beta,
            resp_wm: props.resp_wm.mapv(f64::from),
            resp_iso: props.resp_iso.iter().map(|r| r.mapv(f64::from)).collect(),
            dwi: dwi.data().to_owned(),
            mask: mask.data().to_owned(),
            voxels: mask.foreground_pos(),
            tod: Array4::zeros((x, y, z, n_sh)),
            fiso: Array4::zeros((x, y, z, n_iso)),
            energy: Array3::zeros((x, y, z)),
        };
        field.refresh();
        log::info!(
            "External energy field: {} voxels, {} volumes, lmax = {}, initial energy {:.4e}",
            field.voxels.len(),
            field.n_dwi(),
            field.lmax,
            field.fit_energy()
        );
        Ok(field)
    }

    /// DWI 体积数.
    #[inline]
    pub fn n_dwi(&self) -> usize {
        self.resp_wm.nrows()
    }

    /// 球谐系数个数.
    #[inline]
    pub fn n_sh(&self) -> usize {
        self.resp_wm.ncols()
    }

    /// 空间几何信息.
    #[inline]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// 当前 TOD, 形状 `(x, y, z, n_sh)`.
    #[inline]
    pub fn tod(&self) -> ArrayView4<'_, f32> {
        self.tod.view()
    }

    /// 当前各向同性分量, 形状 `(x, y, z, n_iso)`.
    #[inline]
    pub fn fiso(&self) -> ArrayView4<'_, f32> {
        self.fiso.view()
    }

    /// 逐体素能量.
    #[inline]
    pub fn energy_map(&self) -> ArrayView3<'_, f64> {
        self.energy.view()
    }

    /// 体素 `v` 的 TOD.
    #[inline]
    pub fn tod_at(&self, (x, y, z): Idx3d) -> ArrayView1<'_, f32> {
        self.tod.slice(s![x, y, z, ..])
    }

    /// 已记录的拟合能量总和 (不含粒子势能).
    pub fn fit_energy(&self) -> f64 {
        self.voxels.iter().map(|v| self.energy[*v]).sum()
    }

    /// 按当前 TOD 重新拟合全部掩膜体素并求和, 不修改记录值.
    pub fn recompute_energy(&self) -> f64 {
        self.fit_all().iter().map(|f| f.0).sum()
    }

    /// 按当前 TOD 重新拟合全部掩膜体素, 更新各向同性分量与逐体素能量.
    pub fn refresh(&mut self) {
        let fits = self.fit_all();
        for (v, (e, fiso)) in self.voxels.clone().into_iter().zip(fits) {
            self.energy[v] = e;
            self.fiso.slice_mut(s![v.0, v.1, v.2, ..]).assign(&fiso);
        }
    }

    /// 借助 `rayon`, 并行地拟合全部掩膜体素.
    #[cfg(feature = "rayon")]
    fn fit_all(&self) -> Vec<(f64, Array1<f32>)> {
        self.voxels
            .par_iter()
            .map(|v| self.fit_voxel(*v, self.tod_at(*v)))
            .collect()
    }

    #[cfg(not(feature = "rayon"))]
    fn fit_all(&self) -> Vec<(f64, Array1<f32>)> {
        self.voxels
            .iter()
            .map(|v| self.fit_voxel(*v, self.tod_at(*v)))
            .collect()
    }

    /// 以 `tod` 拟合体素 `v` 的信号, 返回 (能量, 各向同性分量).
    fn fit_voxel(&self, (x, y, z): Idx3d, tod: ArrayView1<f32>) -> (f64, Array1<f32>) {
        let sig = self.dwi.slice(s![x, y, z, ..]);
        let pred = self.resp_wm.dot(&tod.mapv(f64::from));
        let mut r: Array1<f64> = sig.mapv(f64::from) - pred;

        let mut fiso = Array1::zeros(self.resp_iso.len());
        for (f, riso) in fiso.iter_mut().zip(&self.resp_iso) {
            // NaN (零响应且 beta = 0) 经 max 变为 0.
            let c = (r.dot(riso) / (riso.dot(riso) + self.beta)).max(0.0);
            if c > 0.0 {
                r.scaled_add(-c, riso);
            }
            *f = c as f32;
        }
        (r.dot(&r) / self.n_dwi() as f64, fiso)
    }

    /// 粒子中心 `pos` 对周围体素的三线性权重. 只返回掩膜内的体素.
    fn splat(&self, pos: &Point) -> Vec<(Idx3d, f64)> {
        let v = self.geometry.scanner_to_voxel(pos);
        let base = v.map(f64::floor);
        let frac = v - base;
        let (nx, ny, nz) = self.geometry.dims();

        let mut ans = Vec::with_capacity(8);
        for dx in 0..2 {
            for dy in 0..2 {
                for dz in 0..2 {
                    let idx = |b: f64, d: i32, n: usize| {
                        let i = b as i64 + i64::from(d);
                        (i >= 0 && (i as usize) < n).then_some(i as usize)
                    };
                    let (Some(x), Some(y), Some(z)) = (
                        idx(base.x, dx, nx),
                        idx(base.y, dy, ny),
                        idx(base.z, dz, nz),
                    ) else {
                        continue;
                    };
                    if !self.mask[(x, y, z)] {
                        continue;
                    }
                    let w = |f: f64, d: i32| if d == 1 { f } else { 1.0 - f };
                    let weight = w(frac.x, dx) * w(frac.y, dy) * w(frac.z, dz);
                    if weight > 0.0 {
                        ans.push(((x, y, z), weight));
                    }
                }
            }
        }
        ans
    }

    fn apply(&mut self, fit: &VoxelFit) {
        let (x, y, z) = fit.voxel;
        self.tod.slice_mut(s![x, y, z, ..]).assign(&fit.tod);
        self.fiso.slice_mut(s![x, y, z, ..]).assign(&fit.fiso);
        self.energy[fit.voxel] = fit.energy;
    }

    /// 将 TOD 保存为 `.npy` 文件.
    pub fn write_tod<P: AsRef<Path>>(&self, path: P) -> GtResult<()> {
        Ok(ndarray_npy::write_npy(path, &self.tod)?)
    }

    /// 将各向同性分量保存为 `.npy` 文件.
    pub fn write_fiso<P: AsRef<Path>>(&self, path: P) -> GtResult<()> {
        Ok(ndarray_npy::write_npy(path, &self.fiso)?)
    }
}

/// 外部能量计算器.
///
/// 暂存区按体素累计 TOD 增量, 提议被接受时才写回 [`ExternalField`].
/// 状态中没有能量场时, 所有能量变化均为零.
#[derive(Debug)]
pub struct ExternalEnergyComputer {
    stats: Arc<Stats>,
    lmax: u32,
    weight: f64,
    ppot: f64,
    changes: BTreeMap<Idx3d, Array1<f64>>,
    staged: Vec<VoxelFit>,
    de: f64,
}

impl ExternalEnergyComputer {
    /// 创建计算器.
    pub fn new(stats: Arc<Stats>, props: &Properties) -> Self {
        Self {
            stats,
            lmax: props.lmax,
            weight: props.weight,
            ppot: props.ppot,
            changes: BTreeMap::new(),
            staged: Vec::new(),
            de: 0.0,
        }
    }

    /// 累加一个粒子 (`sign = 1`) 或移除一个粒子 (`sign = -1`) 对 TOD 的贡献.
    fn accumulate(&mut self, field: &ExternalField, sign: f64, pos: &Point, dir: &Point) {
        let y = Array1::from(sh::delta_f64([dir.x, dir.y, dir.z], self.lmax));
        for (v, w) in field.splat(pos) {
            self.changes
                .entry(v)
                .or_insert_with(|| Array1::zeros(y.len()))
                .scaled_add(sign * self.weight * w, &y);
        }
    }

    /// 按暂存的 TOD 增量重新拟合受影响体素, 返回拟合能量变化.
    fn eval_changes(&mut self, field: &ExternalField) -> f64 {
        self.staged.clear();
        let mut de = 0.0;
        for (v, d) in &self.changes {
            let mut tod = field.tod_at(*v).to_owned();
            tod.zip_mut_with(d, |t, d| *t += *d as f32);
            let (energy, fiso) = field.fit_voxel(*v, tod.view());
            de += energy - field.energy[*v];
            self.staged.push(VoxelFit {
                voxel: *v,
                tod,
                fiso,
                energy,
            });
        }
        de
    }

    fn finish(&mut self, de: f64) -> f64 {
        self.de = de;
        de / self.stats.text()
    }
}

impl EnergyComputer for ExternalEnergyComputer {
    fn stage_add(&mut self, state: &GtState, pos: &Point, dir: &Point) -> GtResult<f64> {
        self.clear_changes();
        let Some(field) = state.field.as_ref() else {
            return Ok(0.0);
        };
        self.accumulate(field, 1.0, pos, dir);
        let de = self.eval_changes(field) + self.ppot;
        Ok(self.finish(de))
    }

    fn stage_shift(
        &mut self,
        state: &GtState,
        par: ParticleId,
        pos: &Point,
        dir: &Point,
    ) -> GtResult<f64> {
        self.clear_changes();
        let p = state.grid.particle(par)?;
        let Some(field) = state.field.as_ref() else {
            return Ok(0.0);
        };
        self.accumulate(field, -1.0, p.position(), p.direction());
        self.accumulate(field, 1.0, pos, dir);
        let de = self.eval_changes(field);
        Ok(self.finish(de))
    }

    fn stage_remove(&mut self, state: &GtState, par: ParticleId) -> GtResult<f64> {
        self.clear_changes();
        let p = state.grid.particle(par)?;
        let Some(field) = state.field.as_ref() else {
            return Ok(0.0);
        };
        self.accumulate(field, -1.0, p.position(), p.direction());
        let de = self.eval_changes(field) - self.ppot;
        Ok(self.finish(de))
    }

    fn stage_connect(
        &mut self,
        _state: &GtState,
        _pe1: &mut ParticleEnd,
        _pe2: &mut ParticleEnd,
    ) -> GtResult<f64> {
        // 连接不改变 TOD.
        self.clear_changes();
        Ok(0.0)
    }

    fn accept_changes(&mut self, state: &mut GtState) {
        if let Some(field) = state.field.as_mut() {
            for fit in &self.staged {
                field.apply(fit);
            }
        }
        self.stats.inc_eext_tot(self.de);
        self.clear_changes();
    }

    fn clear_changes(&mut self) {
        self.changes.clear();
        self.staged.clear();
        self.de = 0.0;
    }

    fn eval(&self, state: &GtState) -> f64 {
        state.field.as_ref().map_or(0.0, |f| {
            f.recompute_energy() + self.ppot * state.grid.len() as f64
        })
    }
}
