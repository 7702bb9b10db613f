//! The tagged state enum driving the replica. Each non-trivial variant
//! carries the live resources that only exist in that state (the spill
//! queue, chiefly), so they can't be touched from the wrong state.

use crate::model::StateTag;
use crate::spill::SpillQueue;

pub enum State {
    Disconnected,
    Bootstrap(BootstrapData),
    LocalReplay(LocalReplayData),
    Normal(NormalData),
}

pub struct BootstrapData {
    pub spill: Box<dyn SpillQueue>,
}

pub struct LocalReplayData {
    pub spill: Box<dyn SpillQueue>,
}

pub struct NormalData;

impl State {
    pub fn tag(&self) -> StateTag {
        match self {
            State::Disconnected => StateTag::Disconnected,
            State::Bootstrap(_) => StateTag::Bootstrap,
            State::LocalReplay(_) => StateTag::LocalReplay,
            State::Normal(_) => StateTag::Normal,
        }
    }
}
