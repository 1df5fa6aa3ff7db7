mod trainer;

pub use trainer::{LoopState, Termination, TrainingLoop, TrainingRecord, TrainingSummary};
