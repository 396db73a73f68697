//! Metropolis-Hastings 采样器.
//!
//! 每个工作线程循环执行: 抽取提议类型 -> 在状态锁内提议, 评估, 接受/拒绝, 提交
//! -> 推进 [`Stats`]. `Stats::next()` 返回 `false` 是唯一的正常结束方式.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use itertools::Itertools;
use ndarray::Array3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, UnitSphere};

use super::energy::{EnergyComputer, EnergySumComputer, ExternalField};
use super::error::ConfigError;
use super::particle::{ParticleEnd, ParticleId};
use super::properties::{AnnealConfig, Properties};
use super::stats::{MoveKind, Stats};
use super::{GtResult, GtState, ParticleGrid};
use crate::consts::shift::{SIGMA_DIR, SIGMA_POS_FRAC};
use crate::data::{DwiImage, MaskImage, NiftiHeaderAttr, VolumeGeometry};
use crate::{Idx3d, Point};

/// 采样区域: 掩膜内的体素.
#[derive(Debug, Clone)]
pub struct SamplingDomain {
    geometry: VolumeGeometry,
    mask: Array3<bool>,
    voxels: Vec<Idx3d>,
}

impl SamplingDomain {
    /// 以掩膜前景为采样区域.
    pub fn new(mask: &MaskImage) -> GtResult<Self> {
        Self::from_parts(mask.geometry(), mask.data().to_owned())
    }

    /// 以 `mask` 为采样区域, 其形状必须与 `geometry` 一致.
    pub fn from_parts(geometry: VolumeGeometry, mask: Array3<bool>) -> GtResult<Self> {
        if mask.dim() != geometry.dims() {
            return Err(
                ndarray::ShapeError::from_kind(ndarray::ErrorKind::IncompatibleShape).into(),
            );
        }
        let voxels: Vec<Idx3d> = mask
            .indexed_iter()
            .filter_map(|(idx, v)| v.then_some(idx))
            .collect();
        if voxels.is_empty() {
            return Err(ConfigError::EmptyMask.into());
        }
        Ok(Self {
            geometry,
            mask,
            voxels,
        })
    }

    /// 整个图像都是采样区域.
    pub fn full(geometry: VolumeGeometry) -> GtResult<Self> {
        let mask = Array3::from_elem(geometry.dims(), true);
        Self::from_parts(geometry, mask)
    }

    /// 空间几何信息.
    #[inline]
    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    /// 区域体积 (立方毫米).
    #[inline]
    pub fn volume(&self) -> f64 {
        self.voxels.len() as f64 * self.geometry.voxel_volume()
    }

    /// 区域内体素个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.voxels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.voxels.is_empty()
    }

    /// `pos` 是否位于区域内的体素中.
    #[inline]
    pub fn is_inside(&self, pos: &Point) -> bool {
        self.geometry.voxel_of(pos).is_some_and(|v| self.mask[v])
    }

    /// 区域内均匀分布的随机位置.
    pub fn random_position<R: Rng + ?Sized>(&self, rng: &mut R) -> Point {
        let v = self.voxels[rng.gen_range(0..self.voxels.len())];
        let [sx, sy, sz] = self.geometry.spacing();
        self.geometry.voxel_to_scanner(v)
            + Point::new(
                rng.gen_range(-0.5..0.5) * sx,
                rng.gen_range(-0.5..0.5) * sy,
                rng.gen_range(-0.5..0.5) * sz,
            )
    }
}

/// Metropolis-Hastings 采样器.
#[derive(Debug)]
pub struct MhSampler<'a> {
    props: &'a Properties,
    domain: &'a SamplingDomain,
    stats: Arc<Stats>,
    lambda: f64,
    pos_noise: Normal<f64>,
    dir_noise: Normal<f64>,
}

impl<'a> MhSampler<'a> {
    /// 创建采样器. 出生/死亡提议的期望粒子数为 `density * domain.volume()`.
    pub fn new(
        props: &'a Properties,
        domain: &'a SamplingDomain,
        stats: Arc<Stats>,
    ) -> GtResult<Self> {
        props.validate()?;
        let sigma_pos = SIGMA_POS_FRAC * props.length;
        let pos_noise = Normal::new(0.0, sigma_pos)
            .map_err(|_| ConfigError::NotPositive("sigma_pos", sigma_pos))?;
        let dir_noise = Normal::new(0.0, SIGMA_DIR)
            .map_err(|_| ConfigError::NotPositive("sigma_dir", SIGMA_DIR))?;
        Ok(Self {
            props,
            domain,
            stats,
            lambda: props.density * domain.volume(),
            pos_noise,
            dir_noise,
        })
    }

    /// 共享的统计对象.
    #[inline]
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// 以 `threads` 个工作线程运行, 直到 `Stats::next()` 返回 `false`.
    ///
    /// 第 `i` 个线程的能量计算器由 `make_energy(i)` 构建, 随机种子为 `seed + i`.
    /// 任一线程遇到拓扑错误时取消其余线程, 并返回第一个错误.
    pub fn run<F>(
        &self,
        state: &Mutex<GtState>,
        threads: usize,
        seed: u64,
        mut make_energy: F,
    ) -> GtResult<()>
    where
        F: FnMut(usize) -> Box<dyn EnergyComputer>,
    {
        let threads = threads.max(1);
        log::info!(
            "Start MH sampling: {threads} threads, {} iterations, lambda = {:.1}",
            self.stats.n_max(),
            self.lambda
        );

        let results: Vec<GtResult<()>> = thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|i| {
                    let mut worker = Worker {
                        sampler: self,
                        energy: make_energy(i),
                        rng: ChaCha8Rng::seed_from_u64(seed.wrapping_add(i as u64)),
                    };
                    s.spawn(move || worker.run(state))
                })
                .collect();
            handles
                .into_iter()
                .map(|th| th.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        });

        let n = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .grid
            .len();
        log::info!(
            "MH sampling finished: {n} particles, Tint = {:.4e}, acceptance b/d/r/o/c = {}",
            self.stats.tint(),
            MoveKind::ALL
                .iter()
                .map(|&k| format!("{:.3}", self.stats.acceptance_rate(k)))
                .join("/")
        );
        results.into_iter().collect()
    }

    /// 在图像上完成一次完整的全局追踪: 建立能量场与网格, 多线程采样.
    ///
    /// 返回最终状态与统计.
    pub fn run_on_image(
        dwi: &DwiImage,
        mask: &MaskImage,
        props: &Properties,
        cfg: &AnnealConfig,
    ) -> GtResult<(GtState, Arc<Stats>)> {
        props.validate_for(dwi.len_volumes())?;
        let stats = Arc::new(Stats::from_config(cfg)?);
        let domain = SamplingDomain::new(mask)?;
        let field = ExternalField::new(dwi, mask, props)?;
        stats.inc_eext_tot(field.fit_energy());

        let grid = ParticleGrid::new(&dwi.geometry(), props.length);
        let state = Mutex::new(GtState::with_field(grid, field));
        let sampler = MhSampler::new(props, &domain, Arc::clone(&stats))?;
        sampler.run(&state, cfg.threads, cfg.seed, |i| {
            let seed = cfg.seed.wrapping_add((cfg.threads + i) as u64);
            Box::new(EnergySumComputer::from_properties(
                Arc::clone(&stats),
                props,
                seed,
            ))
        })?;

        let state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        Ok((state, stats))
    }
}

/// 单个工作线程.
struct Worker<'s, 'a> {
    sampler: &'s MhSampler<'a>,
    energy: Box<dyn EnergyComputer>,
    rng: ChaCha8Rng,
}

impl<'s, 'a> Worker<'s, 'a> {
    fn run(&mut self, state: &Mutex<GtState>) -> GtResult<()> {
        let stats = Arc::clone(&self.sampler.stats);
        loop {
            let kind = self.sampler.props.pick_move(self.rng.gen());
            let res = {
                let mut guard = state.lock().unwrap_or_else(PoisonError::into_inner);
                self.propose(kind, &mut guard)
            };
            if let Err(e) = res {
                log::warn!("Sampler worker stopped: {e}");
                self.energy.clear_changes();
                stats.cancel();
                return Err(e);
            }
            if !stats.next() {
                return Ok(());
            }
        }
    }

    fn propose(&mut self, kind: MoveKind, state: &mut GtState) -> GtResult<()> {
        self.sampler.stats.inc_n(kind);
        let accepted = match kind {
            MoveKind::Birth => self.birth(state)?,
            MoveKind::Death => self.death(state)?,
            MoveKind::Shift => self.rand_shift(state)?,
            MoveKind::OptShift => self.opt_shift(state)?,
            MoveKind::Connect => self.connect(state)?,
        };
        if accepted {
            self.sampler.stats.inc_na(kind);
        } else {
            self.energy.clear_changes();
        }
        Ok(())
    }

    #[inline]
    fn accept(&mut self, r: f64) -> bool {
        r >= self.rng.gen::<f64>()
    }

    fn random_direction(&mut self) -> Point {
        let [x, y, z]: [f64; 3] = UnitSphere.sample(&mut self.rng);
        Point::new(x, y, z)
    }

    fn birth(&mut self, state: &mut GtState) -> GtResult<bool> {
        let props = self.sampler.props;
        let pos = self.sampler.domain.random_position(&mut self.rng);
        let dir = self.random_direction();
        if !state.grid.contains(&pos) {
            return Ok(false);
        }

        let de = self.energy.stage_add(state, &pos, &dir)?;
        let n = state.grid.len() as f64;
        let r = (-de).exp() * self.sampler.lambda / (n + 1.0) * props.p_death / props.p_birth;
        if !self.accept(r) {
            return Ok(false);
        }
        state.grid.add(pos, dir)?;
        self.energy.accept_changes(state);
        Ok(true)
    }

    fn death(&mut self, state: &mut GtState) -> GtResult<bool> {
        let props = self.sampler.props;
        let Some(id) = state.grid.random(&mut self.rng) else {
            return Ok(false);
        };

        let de = self.energy.stage_remove(state, id)?;
        let n = state.grid.len() as f64;
        let r = (-de).exp() * n / self.sampler.lambda * props.p_birth / props.p_death;
        if !self.accept(r) {
            return Ok(false);
        }
        self.energy.accept_changes(state);
        state.grid.remove(id)?;
        Ok(true)
    }

    fn rand_shift(&mut self, state: &mut GtState) -> GtResult<bool> {
        let Some(id) = state.grid.random(&mut self.rng) else {
            return Ok(false);
        };
        let p = state.grid.particle(id)?;
        let pos = p.position() + gaussian3(&self.sampler.pos_noise, &mut self.rng);
        let dir = (p.direction() + gaussian3(&self.sampler.dir_noise, &mut self.rng))
            .try_normalize(f64::EPSILON)
            .unwrap_or(*p.direction());
        self.try_shift(state, id, pos, dir)
    }

    /// 移动到最能与现有邻居衔接的位置与方向.
    fn opt_shift(&mut self, state: &mut GtState) -> GtResult<bool> {
        let Some(id) = state.grid.random(&mut self.rng) else {
            return Ok(false);
        };
        let grid = &state.grid;
        let pred = grid.partner(id, -1);
        let succ = grid.partner(id, 1);

        let (pos, dir) = match (pred, succ) {
            (None, None) => return Ok(false),
            (Some((q, b)), Some((r, c))) => {
                let e1 = grid.particle(q)?.end_point(b);
                let e2 = grid.particle(r)?.end_point(c);
                let fallback = *grid.particle(id)?.direction();
                let dir = (e2 - e1).try_normalize(f64::EPSILON).unwrap_or(fallback);
                ((e1 + e2) * 0.5, dir)
            }
            (Some((q, b)), None) => {
                let q = grid.particle(q)?;
                (q.end_point(2 * b), q.direction() * f64::from(b))
            }
            (None, Some((r, c))) => {
                let r = grid.particle(r)?;
                (r.end_point(2 * c), r.direction() * -f64::from(c))
            }
        };
        self.try_shift(state, id, pos, dir)
    }

    fn try_shift(
        &mut self,
        state: &mut GtState,
        id: ParticleId,
        pos: Point,
        dir: Point,
    ) -> GtResult<bool> {
        if !self.sampler.domain.is_inside(&pos) || !state.grid.contains(&pos) {
            return Ok(false);
        }
        let de = self.energy.stage_shift(state, id, &pos, &dir)?;
        if !self.accept((-de).exp()) {
            return Ok(false);
        }
        state.grid.shift(id, pos, dir)?;
        self.energy.accept_changes(state);
        Ok(true)
    }

    fn connect(&mut self, state: &mut GtState) -> GtResult<bool> {
        let Some(id) = state.grid.random(&mut self.rng) else {
            return Ok(false);
        };
        let alpha = if self.rng.gen_bool(0.5) { 1 } else { -1 };
        let mut pe1 = ParticleEnd::new(id, alpha);
        let mut pe2 = ParticleEnd::none();

        let de = self.energy.stage_connect(state, &mut pe1, &mut pe2)?;
        let current = state.grid.partner(id, alpha);
        let unchanged = match (pe2.par, current) {
            (None, None) => true,
            (Some(q), Some((c, beta))) => q == c && pe2.alpha == beta,
            _ => false,
        };
        if unchanged || pe2.p_suc <= 0.0 {
            return Ok(false);
        }

        let r = (-de).exp() * pe1.p_suc / pe2.p_suc;
        if !self.accept(r) {
            return Ok(false);
        }
        state.grid.disconnect(id, alpha)?;
        state.grid.connect(&pe1, &pe2)?;
        self.energy.accept_changes(state);
        Ok(true)
    }
}

/// 各分量独立同分布的三维高斯向量.
#[inline]
fn gaussian3<R: Rng + ?Sized>(noise: &Normal<f64>, rng: &mut R) -> Point {
    Point::new(noise.sample(rng), noise.sample(rng), noise.sample(rng))
}
