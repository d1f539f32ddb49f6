use crossbeam_channel::{Receiver, Sender, TrySendError};

pub use crate::audio::{Effect, EffectSpec};

const COMMAND_QUEUE_CAPACITY: usize = 64;

// Structural changes the render thread has to make itself. Everything
// per-track travels through the registry's atomics instead.
pub enum AudioCommand {
    // Effects are built (and plugins instantiated) on the control thread;
    // the render thread only appends the finished box to the master chain.
    InsertMasterEffect(Box<dyn Effect>),
    ClearMasterEffects,
}

impl std::fmt::Debug for AudioCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioCommand::InsertMasterEffect(_) => f.write_str("InsertMasterEffect(..)"),
            AudioCommand::ClearMasterEffects => f.write_str("ClearMasterEffects"),
        }
    }
}

/// Control-thread end of the command queue.
#[derive(Clone)]
pub struct AudioSender {
    tx: Sender<AudioCommand>,
}

impl AudioSender {
    /// Never blocks. Returns false if the queue is full or the engine is gone.
    pub fn send(&self, cmd: AudioCommand) -> bool {
        match self.tx.try_send(cmd) {
            Ok(()) => true,
            Err(TrySendError::Full(cmd)) => {
                log::warn!("audio command queue full, dropping {cmd:?}");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn insert_master_effect(&self, spec: &EffectSpec, sample_rate: f32) -> bool {
        self.send(AudioCommand::InsertMasterEffect(spec.to_effect(sample_rate)))
    }
}

pub fn command_channel() -> (AudioSender, Receiver<AudioCommand>) {
    let (tx, rx) = crossbeam_channel::bounded(COMMAND_QUEUE_CAPACITY);
    (AudioSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_inserts_reach_the_receiver() {
        let (tx, rx) = command_channel();
        let spec = EffectSpec::Compressor { threshold_db: -18.0, ratio: 3.0, attack_secs: 0.01, release_secs: 0.1 };
        assert!(tx.insert_master_effect(&spec, 48000.0));
        assert!(matches!(rx.try_recv(), Ok(AudioCommand::InsertMasterEffect(_))));
    }

    #[test]
    fn full_or_closed_queue_refuses_without_blocking() {
        let (tx, rx) = command_channel();
        for _ in 0..COMMAND_QUEUE_CAPACITY {
            assert!(tx.send(AudioCommand::ClearMasterEffects));
        }
        assert!(!tx.send(AudioCommand::ClearMasterEffects));
        drop(rx);
        assert!(!tx.send(AudioCommand::ClearMasterEffects));
    }
}
