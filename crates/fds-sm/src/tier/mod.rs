//! SSD / HDD tiering: volume placement policies, access ranking, the
//! put-path tier choice and the background hybrid tier controller

mod controller;
mod policy;
mod put_algo;
mod rank;

pub use controller::{HybridTierCtrlr, TierRunStats};
pub use policy::{PRIORITY_HIGHEST, PRIORITY_LOWEST, VolumeDesc, VolumePolicyTable};
pub use put_algo::{RandomTestAlgo, RankTierPutAlgo, TierPutAlgorithm};
pub use rank::{ObjRank, RANK_SCALE, RankEngine};
