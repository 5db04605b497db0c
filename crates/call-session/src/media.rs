//! Audio device binding
//!
//! Once a call's media is negotiated its audio stream has to be connected to
//! the local playback and capture devices. The session core only decides
//! *when* to do that; *how* is behind [`AudioDeviceBinder`].

use crate::engine::ProtocolCall;
use crate::error::EngineResult;

/// Attaches a call's negotiated audio to the sound device
pub trait AudioDeviceBinder: Send + Sync {
    fn bind(&self, call: &dyn ProtocolCall) -> EngineResult<()>;
}

/// Lets the engine's call object connect its own audio
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineAudioBinder;

impl AudioDeviceBinder for EngineAudioBinder {
    fn bind(&self, call: &dyn ProtocolCall) -> EngineResult<()> {
        call.connect_audio_device()
    }
}
