//! 程序运行函数.

use crate::result::{AblationResult, Profile};
use dwi_berry::prelude::*;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;
use utils::phantom;

/// 体模尺寸与体素边长 (毫米).
const DIMS: Idx3d = (15, 15, 4);
const SPACING: f64 = 2.0;

/// 轨迹至少包含的粒子个数.
const MIN_PARTICLES: usize = 3;

/// 参与比较的温度设置 `(name, T0, T1)`.
const SCHEDULES: [(&str, f64, f64); 3] = [
    ("default", DEFAULT_T0, DEFAULT_T1),
    ("hot", 1.0, DEFAULT_T1),
    ("quench", DEFAULT_T1, DEFAULT_T1),
];

/// 实际运行.
pub fn run() -> AblationResult {
    let (dwi, mask, props) = phantom::crossing(DIMS, SPACING);
    let n_iter = utils::niter_from_env_or(2_000_000);
    let threads = utils::threads_from_env_or(utils::cpus() / SCHEDULES.len());
    let log_dir = utils::stats_log_dir_from_env();

    println!("Running ablation studies...");
    thread::scope(|s| {
        let handles = SCHEDULES.map(|(name, t0, t1)| {
            let cfg = AnnealConfig {
                t0,
                t1,
                max_iter: n_iter,
                threads,
                seed: 42,
            };
            let (dwi, mask, props, log_dir) = (&dwi, &mask, &props, log_dir.as_deref());
            s.spawn(move || anneal(name, dwi, mask, props, &cfg, log_dir))
        });

        AblationResult::from_iter(
            SCHEDULES.map(|(name, ..)| name).into_iter().zip(
                handles
                    .into_iter()
                    .map(|th| th.join().expect("Thread joining error")),
            ),
        )
    })
}

/// 在体模上运行一组退火设置. 若给出 `log_dir`, 同时写出统计日志与最终 TOD.
fn anneal(
    name: &str,
    dwi: &DwiImage,
    mask: &MaskImage,
    props: &Properties,
    cfg: &AnnealConfig,
    log_dir: Option<&std::path::Path>,
) -> GtResult<Profile> {
    let start = Instant::now();
    props.validate_for(dwi.len_volumes())?;
    let stats = Arc::new(Stats::from_config(cfg)?);
    if let Some(dir) = log_dir {
        stats.open_stream(dir.join(format!("{name}.log")))?;
    }

    let domain = SamplingDomain::new(mask)?;
    let field = ExternalField::new(dwi, mask, props)?;
    stats.inc_eext_tot(field.fit_energy());
    let grid = ParticleGrid::new(&dwi.geometry(), props.length);
    let state = Mutex::new(GtState::with_field(grid, field));

    let sampler = MhSampler::new(props, &domain, Arc::clone(&stats))?;
    sampler.run(&state, cfg.threads, cfg.seed, |i| {
        Box::new(EnergySumComputer::from_properties(
            Arc::clone(&stats),
            props,
            cfg.seed.wrapping_add(1000 + i as u64),
        ))
    })?;
    stats.close_stream()?;

    let mut state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
    state.grid.check_consistency()?;
    if let (Some(dir), Some(field)) = (log_dir, state.field.as_ref()) {
        field.write_tod(dir.join(format!("{name}_tod.npy")))?;
        field.write_fiso(dir.join(format!("{name}_fiso.npy")))?;
    }

    let tracks = export_tracks(&mut state.grid, MIN_PARTICLES)?;
    Ok(Profile {
        snapshot: stats.snapshot(),
        n_particles: state.grid.len(),
        n_tracks: tracks.len(),
        mean_track_length: (!tracks.is_empty()).then(|| {
            tracks.iter().map(Track::arc_length).sum::<f64>() / tracks.len() as f64
        }),
        elapsed: start.elapsed(),
    })
}
