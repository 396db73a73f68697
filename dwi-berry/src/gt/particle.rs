//! 粒子 (轨迹片段) 与粒子池.
//!
//! 粒子之间的前驱/后继连接以池内索引表示, 而非裸指针.
//! 所有涉及两个粒子的连接操作都由 [`ParticlePool`] 完成,
//! 从而保证连接始终是双向对称的.

use super::error::TopologyError;
use crate::Point;
use rand::Rng;

/// 粒子在粒子池中的索引.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParticleId(usize);

impl ParticleId {
    /// 底层索引值.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// 一个粒子: 位于 `position`, 方向为 `direction`, 半长为 `length` 的线段.
///
/// 粒子带有身份 (被其它粒子引用), 因此不实现 `Clone`.
#[derive(Debug)]
pub struct Particle {
    position: Point,
    direction: Point,
    length: f64,
    predecessor: Option<ParticleId>,
    successor: Option<ParticleId>,
    alive: bool,
    visited: bool,
}

impl Particle {
    /// 创建一个惰性 (未存活) 粒子.
    pub fn inert(length: f64) -> Self {
        Self {
            position: Point::zeros(),
            direction: Point::z(),
            length,
            predecessor: None,
            successor: None,
            alive: false,
            visited: false,
        }
    }

    /// 以 `pos`, `dir` 初始化粒子并标记为存活. `dir` 会被归一化,
    /// 遗留的连接会被直接清除 (调用方负责此前已断开邻居一侧).
    pub fn init(&mut self, pos: Point, dir: Point) {
        self.position = pos;
        self.set_direction(dir);
        self.predecessor = None;
        self.successor = None;
        self.alive = true;
        self.visited = false;
    }

    #[inline]
    pub fn position(&self) -> &Point {
        &self.position
    }

    #[inline]
    pub fn set_position(&mut self, pos: Point) {
        self.position = pos;
    }

    #[inline]
    pub fn direction(&self) -> &Point {
        &self.direction
    }

    /// 设置方向. 写入前归一化; 零向量保持原方向不变.
    pub fn set_direction(&mut self, dir: Point) {
        if let Some(d) = dir.try_normalize(f64::EPSILON) {
            self.direction = d;
        }
    }

    /// 粒子半长 (毫米).
    #[inline]
    pub fn length(&self) -> f64 {
        self.length
    }

    /// 获取 `position + a * L * direction`.
    ///
    /// `a = ±1` 是线段的两个物理端点.
    #[inline]
    pub fn end_point(&self, a: i32) -> Point {
        self.position + self.direction * (f64::from(a) * self.length)
    }

    #[inline]
    pub fn predecessor(&self) -> Option<ParticleId> {
        self.predecessor
    }

    #[inline]
    pub fn successor(&self) -> Option<ParticleId> {
        self.successor
    }

    #[inline]
    pub fn has_predecessor(&self) -> bool {
        self.predecessor.is_some()
    }

    #[inline]
    pub fn has_successor(&self) -> bool {
        self.successor.is_some()
    }

    /// 端点 `alpha` 上的邻居. `-1` 为前驱, `+1` 为后继, 其它值为 `None`.
    #[inline]
    pub fn link(&self, alpha: i32) -> Option<ParticleId> {
        match alpha {
            -1 => self.predecessor,
            1 => self.successor,
            _ => None,
        }
    }

    /// 若 `other` 连在本粒子上, 返回其所在端点编号.
    #[inline]
    pub fn end_towards(&self, other: ParticleId) -> Option<i32> {
        if self.predecessor == Some(other) {
            Some(-1)
        } else if self.successor == Some(other) {
            Some(1)
        } else {
            None
        }
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    #[inline]
    pub fn is_visited(&self) -> bool {
        self.visited
    }

    #[inline]
    pub fn set_visited(&mut self, v: bool) {
        self.visited = v;
    }

    #[inline]
    fn link_mut(&mut self, alpha: i32) -> &mut Option<ParticleId> {
        if alpha < 0 {
            &mut self.predecessor
        } else {
            &mut self.successor
        }
    }
}

/// 候选邻居端点或待建立连接的轻量描述. 每次提议都重新构造.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ParticleEnd {
    /// 粒子. `None` 表示 "不连接".
    pub par: Option<ParticleId>,

    /// 端点编号, 取值 `-1`, `0` 或 `+1`.
    pub alpha: i32,

    /// 提议该端点的概率.
    pub p_suc: f64,

    /// 连接能量.
    pub e_conn: f64,
}

impl ParticleEnd {
    /// 以粒子 `par` 的端点 `alpha` 构建.
    #[inline]
    pub fn new(par: ParticleId, alpha: i32) -> Self {
        Self {
            par: Some(par),
            alpha,
            p_suc: 1.0,
            e_conn: 0.0,
        }
    }

    /// 空端点.
    #[inline]
    pub const fn none() -> Self {
        Self {
            par: None,
            alpha: 0,
            p_suc: 1.0,
            e_conn: 0.0,
        }
    }
}

impl Default for ParticleEnd {
    #[inline]
    fn default() -> Self {
        Self::none()
    }
}

#[inline]
fn check_end(alpha: i32) -> Result<(), TopologyError> {
    if alpha == 1 || alpha == -1 {
        Ok(())
    } else {
        Err(TopologyError::InvalidEnd(alpha))
    }
}

/// 粒子池. 连续存储所有粒子, 死亡粒子的槽位通过空闲链表复用.
#[derive(Debug)]
pub struct ParticlePool {
    particles: Vec<Particle>,
    free: Vec<ParticleId>,

    /// 存活粒子的稠密列表, 用于 O(1) 随机选取.
    alive: Vec<ParticleId>,

    /// `particles` 下标 -> `alive` 下标.
    alive_slot: Vec<usize>,
    length: f64,
}

impl ParticlePool {
    /// 创建空粒子池. `length` 为所有粒子共享的半长 (毫米).
    pub fn new(length: f64) -> Self {
        Self {
            particles: Vec::with_capacity(1024),
            free: Vec::new(),
            alive: Vec::with_capacity(1024),
            alive_slot: Vec::with_capacity(1024),
            length,
        }
    }

    /// 粒子半长.
    #[inline]
    pub fn length(&self) -> f64 {
        self.length
    }

    /// 存活粒子个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.alive.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    /// 创建一个新粒子, 优先复用空闲槽位.
    pub fn create(&mut self, pos: Point, dir: Point) -> ParticleId {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.particles.push(Particle::inert(self.length));
                self.alive_slot.push(usize::MAX);
                ParticleId(self.particles.len() - 1)
            }
        };
        self.particles[id.0].init(pos, dir);
        self.alive_slot[id.0] = self.alive.len();
        self.alive.push(id);
        id
    }

    /// 断开粒子的全部连接并销毁它. 对已死亡粒子调用是无操作.
    pub fn destroy(&mut self, id: ParticleId) -> Result<(), TopologyError> {
        if !self.particles.get(id.0).is_some_and(Particle::is_alive) {
            return Ok(());
        }
        self.finalize(id)?;

        let slot = self.alive_slot[id.0];
        self.alive.swap_remove(slot);
        if let Some(moved) = self.alive.get(slot).copied() {
            self.alive_slot[moved.0] = slot;
        }
        self.alive_slot[id.0] = usize::MAX;
        self.free.push(id);
        Ok(())
    }

    /// 断开 `id` 的前驱、后继连接 (同时清除邻居一侧), 并标记为未存活.
    /// 对已死亡粒子调用是安全的无操作.
    pub fn finalize(&mut self, id: ParticleId) -> Result<(), TopologyError> {
        if !self.particles.get(id.0).is_some_and(Particle::is_alive) {
            return Ok(());
        }
        if self.particles[id.0].has_predecessor() {
            self.remove_predecessor(id)?;
        }
        if self.particles[id.0].has_successor() {
            self.remove_successor(id)?;
        }
        self.particles[id.0].alive = false;
        self.particles[id.0].visited = false;
        Ok(())
    }

    /// 获取存活粒子.
    #[inline]
    pub fn get(&self, id: ParticleId) -> Option<&Particle> {
        self.particles.get(id.0).filter(|p| p.alive)
    }

    /// 获取存活粒子. 粒子不存在时返回拓扑错误.
    #[inline]
    pub fn particle(&self, id: ParticleId) -> Result<&Particle, TopologyError> {
        self.get(id).ok_or(TopologyError::DeadParticle(id))
    }

    /// 获取可变的存活粒子. 连接字段只能通过池操作修改.
    #[inline]
    pub fn particle_mut(&mut self, id: ParticleId) -> Result<&mut Particle, TopologyError> {
        self.particles
            .get_mut(id.0)
            .filter(|p| p.alive)
            .ok_or(TopologyError::DeadParticle(id))
    }

    /// 均匀随机地选取一个存活粒子. 池为空时返回 `None`.
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<ParticleId> {
        if self.alive.is_empty() {
            None
        } else {
            Some(self.alive[rng.gen_range(0..self.alive.len())])
        }
    }

    /// 迭代所有存活粒子.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (ParticleId, &Particle)> {
        self.alive.iter().map(|&id| (id, &self.particles[id.0]))
    }

    /// 所有存活粒子 id 的快照.
    #[inline]
    pub fn ids(&self) -> &[ParticleId] {
        &self.alive
    }

    /// 清空粒子池.
    pub fn clear(&mut self) {
        self.particles.clear();
        self.free.clear();
        self.alive.clear();
        self.alive_slot.clear();
    }

    /// 令 `p` 成为 `this` 的前驱. `a = +1` 时 `this` 成为 `p` 的后继,
    /// `a = -1` 时 `this` 成为 `p` 的前驱.
    #[inline]
    pub fn connect_predecessor(
        &mut self,
        this: ParticleId,
        p: ParticleId,
        a: i32,
    ) -> Result<(), TopologyError> {
        self.link(this, -1, p, a)
    }

    /// 令 `p` 成为 `this` 的后继. `a` 的含义同 [`Self::connect_predecessor`].
    #[inline]
    pub fn connect_successor(
        &mut self,
        this: ParticleId,
        p: ParticleId,
        a: i32,
    ) -> Result<(), TopologyError> {
        self.link(this, 1, p, a)
    }

    /// 断开 `this` 与其前驱的连接, 同时清除前驱一侧的指针.
    #[inline]
    pub fn remove_predecessor(&mut self, this: ParticleId) -> Result<ParticleId, TopologyError> {
        self.unlink(this, -1)
    }

    /// 断开 `this` 与其后继的连接, 同时清除后继一侧的指针.
    #[inline]
    pub fn remove_successor(&mut self, this: ParticleId) -> Result<ParticleId, TopologyError> {
        self.unlink(this, 1)
    }

    /// 连接 `this` 的 `alpha` 端与 `other` 的 `beta` 端.
    pub fn link(
        &mut self,
        this: ParticleId,
        alpha: i32,
        other: ParticleId,
        beta: i32,
    ) -> Result<(), TopologyError> {
        check_end(alpha)?;
        check_end(beta)?;
        if this == other {
            return Err(TopologyError::SelfLink(this));
        }
        let p = self.particle(this)?;
        let q = self.particle(other)?;
        if p.link(alpha).is_some() {
            return Err(TopologyError::EndOccupied(this, alpha));
        }
        if q.link(beta).is_some() {
            return Err(TopologyError::EndOccupied(other, beta));
        }
        if p.end_towards(other).is_some() {
            return Err(TopologyError::DoubleLink(this, other));
        }

        *self.particles[this.0].link_mut(alpha) = Some(other);
        *self.particles[other.0].link_mut(beta) = Some(this);
        Ok(())
    }

    /// 断开 `this` 的 `alpha` 端连接, 返回原邻居.
    pub fn unlink(&mut self, this: ParticleId, alpha: i32) -> Result<ParticleId, TopologyError> {
        check_end(alpha)?;
        let other = self
            .particle(this)?
            .link(alpha)
            .ok_or(TopologyError::MissingLink(this, alpha))?;
        let beta = self
            .get(other)
            .and_then(|q| q.end_towards(this))
            .ok_or(TopologyError::NotReciprocal(this, other))?;

        *self.particles[this.0].link_mut(alpha) = None;
        *self.particles[other.0].link_mut(beta) = None;
        Ok(other)
    }

    /// `this` 的 `alpha` 端上的邻居端点 `(邻居, 邻居端点编号)`.
    pub fn partner(&self, this: ParticleId, alpha: i32) -> Option<(ParticleId, i32)> {
        let other = self.get(this)?.link(alpha)?;
        let beta = self.get(other)?.end_towards(this)?;
        Some((other, beta))
    }

    /// 检查所有存活粒子的连接是否双向对称.
    pub fn check_reciprocity(&self) -> Result<(), TopologyError> {
        for (id, p) in self.iter() {
            for other in [p.predecessor, p.successor].into_iter().flatten() {
                if !self.get(other).is_some_and(|q| q.end_towards(id).is_some()) {
                    return Err(TopologyError::NotReciprocal(id, other));
                }
            }
        }
        Ok(())
    }

    /// 将所有粒子的 `visited` 标记清零.
    pub fn reset_visited(&mut self) {
        self.particles.iter_mut().for_each(|p| p.visited = false);
    }
}

#[cfg(test)]
mod tests {
    use super::{ParticleId, ParticlePool};
    use crate::gt::error::TopologyError;
    use crate::Point;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn pool_with(n: usize) -> (ParticlePool, Vec<ParticleId>) {
        let mut pool = ParticlePool::new(1.0);
        let ids = (0..n)
            .map(|i| pool.create(Point::new(i as f64 * 2.0, 0.0, 0.0), Point::x()))
            .collect();
        (pool, ids)
    }

    #[test]
    fn test_direction_is_normalized() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut pool = ParticlePool::new(1.0);
        for _ in 0..200 {
            let dir = Point::new(
                rng.gen_range(-5.0..5.0),
                rng.gen_range(-5.0..5.0),
                rng.gen_range(-5.0..5.0),
            );
            let id = pool.create(Point::zeros(), dir);
            assert!((pool.particle(id).unwrap().direction().norm() - 1.0).abs() < 1e-6);

            let dir2 = Point::new(rng.gen_range(-9.0..9.0), 1e-3, rng.gen_range(-9.0..9.0));
            pool.particle_mut(id).unwrap().set_direction(dir2);
            assert!((pool.particle(id).unwrap().direction().norm() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_end_points() {
        let mut pool = ParticlePool::new(0.5);
        let id = pool.create(Point::new(1.0, 2.0, 3.0), Point::new(0.0, 0.0, 2.0));
        let p = pool.particle(id).unwrap();
        assert_eq!(p.end_point(1), Point::new(1.0, 2.0, 3.5));
        assert_eq!(p.end_point(-1), Point::new(1.0, 2.0, 2.5));
        assert_eq!(p.end_point(2), Point::new(1.0, 2.0, 4.0));
    }

    #[test]
    fn test_connect_both_orientations() {
        let (mut pool, ids) = pool_with(3);
        let (a, b, c) = (ids[0], ids[1], ids[2]);

        // a -> b 正向: a 的后继是 b, b 的前驱是 a.
        pool.connect_successor(a, b, -1).unwrap();
        assert_eq!(pool.particle(a).unwrap().successor(), Some(b));
        assert_eq!(pool.particle(b).unwrap().predecessor(), Some(a));

        // b 与 c 反向: b 的后继是 c, c 的后继也是 b.
        pool.connect_successor(b, c, 1).unwrap();
        assert_eq!(pool.particle(c).unwrap().successor(), Some(b));
        assert_eq!(pool.partner(b, 1), Some((c, 1)));
        assert_eq!(pool.partner(c, 1), Some((b, 1)));
        pool.check_reciprocity().unwrap();

        assert_eq!(pool.remove_successor(c), Ok(b));
        assert!(!pool.particle(b).unwrap().has_successor());
        pool.check_reciprocity().unwrap();
    }

    #[test]
    fn test_connect_errors() {
        let (mut pool, ids) = pool_with(3);
        let (a, b, c) = (ids[0], ids[1], ids[2]);

        assert_eq!(pool.link(a, 0, b, 1), Err(TopologyError::InvalidEnd(0)));
        assert_eq!(pool.link(a, 1, a, -1), Err(TopologyError::SelfLink(a)));
        pool.link(a, 1, b, -1).unwrap();
        assert_eq!(pool.link(a, 1, c, -1), Err(TopologyError::EndOccupied(a, 1)));
        assert_eq!(pool.link(c, 1, b, -1), Err(TopologyError::EndOccupied(b, -1)));
        assert_eq!(pool.link(a, -1, b, 1), Err(TopologyError::DoubleLink(a, b)));
        assert_eq!(
            pool.remove_predecessor(c),
            Err(TopologyError::MissingLink(c, -1))
        );
    }

    #[test]
    fn test_finalize_idempotent() {
        let (mut pool, ids) = pool_with(3);
        pool.link(ids[0], 1, ids[1], -1).unwrap();
        pool.link(ids[1], 1, ids[2], -1).unwrap();

        pool.destroy(ids[1]).unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.get(ids[1]).is_none());
        assert!(!pool.particle(ids[0]).unwrap().has_successor());
        assert!(!pool.particle(ids[2]).unwrap().has_predecessor());

        // 重复销毁/终结不应产生任何影响.
        pool.destroy(ids[1]).unwrap();
        pool.finalize(ids[1]).unwrap();
        assert_eq!(pool.len(), 2);
        pool.check_reciprocity().unwrap();

        // 槽位被复用.
        let d = pool.create(Point::zeros(), Point::y());
        assert_eq!(d, ids[1]);
        assert!(!pool.particle(d).unwrap().has_predecessor());
    }

    /// 随机连接/断开/销毁, 每一步之后检查对称性.
    #[test]
    fn test_random_topology_keeps_reciprocity() {
        let mut rng = ChaCha8Rng::seed_from_u64(2024);
        let (mut pool, _) = pool_with(24);

        for _ in 0..5000 {
            let Some(a) = pool.random(&mut rng) else {
                pool.create(Point::zeros(), Point::x());
                continue;
            };
            let alpha = if rng.gen_bool(0.5) { 1 } else { -1 };
            match rng.gen_range(0..10) {
                0..=4 => {
                    let b = pool.random(&mut rng).unwrap();
                    let beta = if rng.gen_bool(0.5) { 1 } else { -1 };
                    let _ = pool.link(a, alpha, b, beta);
                }
                5..=7 => {
                    let _ = pool.unlink(a, alpha);
                }
                8 => pool.destroy(a).unwrap(),
                _ => {
                    pool.create(Point::zeros(), Point::z());
                }
            }
            pool.check_reciprocity().unwrap();
            for (id, p) in pool.iter() {
                for alpha in [-1, 1] {
                    if let Some((q, beta)) = pool.partner(id, alpha) {
                        assert_eq!(pool.particle(q).unwrap().link(beta), Some(id));
                    } else {
                        assert!(p.link(alpha).is_none());
                    }
                }
            }
        }
    }

    #[test]
    fn test_random_selection_covers_alive_only() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let (mut pool, ids) = pool_with(4);
        pool.destroy(ids[2]).unwrap();
        for _ in 0..200 {
            let id = pool.random(&mut rng).unwrap();
            assert_ne!(id, ids[2]);
        }
        assert!(ParticlePool::new(1.0).random(&mut rng).is_none());
    }
}
