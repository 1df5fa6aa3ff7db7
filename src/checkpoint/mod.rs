mod record;

pub use record::{
    best_checkpoint, list_checkpoints, load_checkpoint, save_checkpoint, Checkpoint,
    CheckpointData, CHECKPOINT_VERSION,
};
