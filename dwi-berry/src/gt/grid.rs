//! 粒子空间网格.
//!
//! 将图像包围盒划分为边长 `2L` 的立方体单元, 每个单元记录位于其中的粒子.
//! 这样, 任意一次邻居查询只需检查查询球包围盒覆盖到的少量单元.

use super::error::TopologyError;
use super::particle::{Particle, ParticleEnd, ParticleId, ParticlePool};
use super::{GtError, GtResult};
use crate::data::VolumeGeometry;
use crate::{Idx3d, Point};
use rand::Rng;

/// 粒子网格. 同时拥有粒子池, 所有粒子的增删移动都经由网格完成,
/// 以保证粒子图与空间索引始终一致.
#[derive(Debug)]
pub struct ParticleGrid {
    pool: ParticlePool,
    cells: Vec<Vec<ParticleId>>,
    dims: Idx3d,
    lower: Point,
    cell_size: f64,
}

impl ParticleGrid {
    /// 在 `geometry` 覆盖的范围上建立网格, 粒子半长为 `length`.
    pub fn new(geometry: &VolumeGeometry, length: f64) -> Self {
        assert!(length.is_finite() && length > 0.0);
        let cell_size = 2.0 * length;
        let ext = geometry.extent();
        let n = |e: f64| ((e / cell_size).ceil() as usize).max(1);
        let dims = (n(ext.x), n(ext.y), n(ext.z));
        log::debug!(
            "Initialise particle grid: {}x{}x{} cells of {cell_size} mm",
            dims.0,
            dims.1,
            dims.2
        );
        Self {
            pool: ParticlePool::new(length),
            cells: vec![Vec::new(); dims.0 * dims.1 * dims.2],
            dims,
            lower: geometry.lower_corner(),
            cell_size,
        }
    }

    /// 网格单元个数 `(x, y, z)`.
    #[inline]
    pub fn dims(&self) -> Idx3d {
        self.dims
    }

    /// 单元边长 (毫米).
    #[inline]
    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// 粒子半长.
    #[inline]
    pub fn length(&self) -> f64 {
        self.pool.length()
    }

    /// 底层粒子池.
    #[inline]
    pub fn pool(&self) -> &ParticlePool {
        &self.pool
    }

    /// 存活粒子个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// 获取存活粒子.
    #[inline]
    pub fn get(&self, id: ParticleId) -> Option<&Particle> {
        self.pool.get(id)
    }

    /// 获取存活粒子, 不存在时返回拓扑错误.
    #[inline]
    pub fn particle(&self, id: ParticleId) -> Result<&Particle, TopologyError> {
        self.pool.particle(id)
    }

    /// 迭代所有存活粒子.
    #[inline]
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (ParticleId, &Particle)> {
        self.pool.iter()
    }

    /// 均匀随机地选取一个存活粒子.
    #[inline]
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<ParticleId> {
        self.pool.random(rng)
    }

    /// 连续网格坐标, 可能越界.
    #[inline]
    fn grid_coord(&self, pos: &Point) -> Point {
        (pos - self.lower) / self.cell_size
    }

    /// 包含 `pos` 的单元的三维索引. 越界时返回 `None`.
    pub fn cell_of(&self, pos: &Point) -> Option<Idx3d> {
        let g = self.grid_coord(pos);
        let idx = |c: f64, n: usize| {
            let f = c.floor();
            (f >= 0.0 && (f as usize) < n).then_some(f as usize)
        };
        Some((
            idx(g.x, self.dims.0)?,
            idx(g.y, self.dims.1)?,
            idx(g.z, self.dims.2)?,
        ))
    }

    #[inline]
    fn flat((x, y, z): Idx3d, (_, ny, nz): Idx3d) -> usize {
        (x * ny + y) * nz + z
    }

    fn cell_index(&self, pos: &Point) -> GtResult<usize> {
        self.cell_of(pos)
            .map(|c| Self::flat(c, self.dims))
            .ok_or(GtError::OutOfBounds(pos.x, pos.y, pos.z))
    }

    /// `pos` 是否在网格范围内.
    #[inline]
    pub fn contains(&self, pos: &Point) -> bool {
        self.cell_of(pos).is_some()
    }

    /// 在 `pos` 处以方向 `dir` 新建粒子.
    pub fn add(&mut self, pos: Point, dir: Point) -> GtResult<ParticleId> {
        let cell = self.cell_index(&pos)?;
        let id = self.pool.create(pos, dir);
        self.cells[cell].push(id);
        Ok(id)
    }

    /// 将粒子 `id` 移动到 `pos`, 方向改为 `dir`. 必要时更新单元归属.
    pub fn shift(&mut self, id: ParticleId, pos: Point, dir: Point) -> GtResult<()> {
        let from = self.cell_index(self.pool.particle(id)?.position())?;
        let to = self.cell_index(&pos)?;
        let p = self.pool.particle_mut(id)?;
        p.set_position(pos);
        p.set_direction(dir);
        if from != to {
            self.detach(from, id);
            self.cells[to].push(id);
        }
        Ok(())
    }

    /// 断开粒子全部连接并将其删除.
    pub fn remove(&mut self, id: ParticleId) -> GtResult<()> {
        let cell = self.cell_index(self.pool.particle(id)?.position())?;
        self.pool.destroy(id)?;
        self.detach(cell, id);
        Ok(())
    }

    fn detach(&mut self, cell: usize, id: ParticleId) {
        let v = &mut self.cells[cell];
        if let Some(i) = v.iter().position(|p| *p == id) {
            v.swap_remove(i);
        }
    }

    /// 删除全部粒子.
    pub fn clear(&mut self) {
        self.pool.clear();
        self.cells.iter_mut().for_each(Vec::clear);
    }

    /// 连接两个粒子端点.
    pub fn connect(&mut self, pe1: &ParticleEnd, pe2: &ParticleEnd) -> GtResult<()> {
        let (Some(a), Some(b)) = (pe1.par, pe2.par) else {
            return Ok(());
        };
        Ok(self.pool.link(a, pe1.alpha, b, pe2.alpha)?)
    }

    /// 断开粒子 `id` 在 `alpha` 端上的连接 (若存在), 返回原邻居.
    pub fn disconnect(&mut self, id: ParticleId, alpha: i32) -> GtResult<Option<ParticleId>> {
        if self.pool.particle(id)?.link(alpha).is_none() {
            return Ok(None);
        }
        Ok(Some(self.pool.unlink(id, alpha)?))
    }

    /// 粒子 `id` 在 `alpha` 端上的邻居及其对应端点编号.
    #[inline]
    pub fn partner(&self, id: ParticleId, alpha: i32) -> Option<(ParticleId, i32)> {
        self.pool.partner(id, alpha)
    }

    /// 包含 `pos` 的单元及其 26 个相邻单元中的全部粒子.
    pub fn adjacent(&self, pos: &Point) -> Vec<ParticleId> {
        let mut ans = Vec::with_capacity(32);
        let g = self.grid_coord(pos);
        let c = (g.x.floor() as i64, g.y.floor() as i64, g.z.floor() as i64);
        self.for_cells_in((c.0 - 1, c.1 - 1, c.2 - 1), (c.0 + 1, c.1 + 1, c.2 + 1), |v| {
            ans.extend_from_slice(v)
        });
        ans
    }

    /// 对中心与 `pos` 距离严格小于 `radius` 的每个粒子调用 `f`.
    pub fn for_each_within<F: FnMut(ParticleId, &Particle)>(
        &self,
        pos: &Point,
        radius: f64,
        mut f: F,
    ) {
        let lo = self.grid_coord(&pos.add_scalar(-radius));
        let hi = self.grid_coord(&pos.add_scalar(radius));
        let floor = |v: &Point| (v.x.floor() as i64, v.y.floor() as i64, v.z.floor() as i64);
        let r2 = radius * radius;
        self.for_cells_in(floor(&lo), floor(&hi), |v| {
            for &id in v {
                if let Some(p) = self.pool.get(id) {
                    if (p.position() - pos).norm_squared() < r2 {
                        f(id, p);
                    }
                }
            }
        });
    }

    /// 对 `lo..=hi` (网格坐标, 自动裁剪) 范围内的单元调用 `f`.
    fn for_cells_in<F>(&self, lo: (i64, i64, i64), hi: (i64, i64, i64), mut f: F)
    where
        F: FnMut(&[ParticleId]),
    {
        let clip = |l: i64, h: i64, n: usize| l.max(0)..=h.min(n as i64 - 1);
        for x in clip(lo.0, hi.0, self.dims.0) {
            for y in clip(lo.1, hi.1, self.dims.1) {
                for z in clip(lo.2, hi.2, self.dims.2) {
                    let idx = Self::flat((x as usize, y as usize, z as usize), self.dims);
                    f(self.cells[idx].as_slice());
                }
            }
        }
    }

    /// 检查空间索引与粒子池的一致性: 每个存活粒子恰好出现在其位置对应的单元中.
    pub fn check_consistency(&self) -> GtResult<()> {
        self.pool.check_reciprocity()?;
        let listed: usize = self.cells.iter().map(Vec::len).sum();
        for (id, p) in self.pool.iter() {
            let cell = self.cell_index(p.position())?;
            if !self.cells[cell].contains(&id) {
                return Err(TopologyError::DeadParticle(id).into());
            }
        }
        if listed != self.pool.len() {
            let stale = self
                .cells
                .iter()
                .flatten()
                .find(|id| self.pool.get(**id).is_none())
                .copied();
            if let Some(id) = stale {
                return Err(TopologyError::DeadParticle(id).into());
            }
        }
        Ok(())
    }

    pub(crate) fn pool_mut(&mut self) -> &mut ParticlePool {
        &mut self.pool
    }
}
