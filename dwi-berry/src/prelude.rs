//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Point};

pub use crate::data::{DwiImage, MaskImage, NiftiHeaderAttr, VolumeGeometry};

pub use crate::gt::{
    export_tracks, AnnealConfig, EnergyComputer, EnergySumComputer, ExternalField, GtError,
    GtResult, GtState, MhSampler, MoveKind, ParticleGrid, Properties, SamplingDomain, Stats,
    Track,
};

pub use crate::consts::anneal::{DEFAULT_MAX_ITER, DEFAULT_T0, DEFAULT_T1};
