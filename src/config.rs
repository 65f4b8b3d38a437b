use std::path::PathBuf;
use std::time::Duration;

/// Which side starts recording once the call reaches `Connected`.
///
/// The source clients disagreed on this; `CallerOnly` is the canonical
/// policy so each call yields exactly one upload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordingPolicy {
    #[default]
    CallerOnly,
    BothSides,
    Disabled,
}

#[derive(Clone, Debug)]
pub struct CallConfig {
    /// WebSocket signaling endpoint, e.g. `wss://example.com/signal`.
    pub signaling_url: String,
    /// REST base URL for the recording upload collaborator.
    pub api_base_url: String,
    /// STUN/TURN servers handed to the peer-connection factory.
    pub ice_servers: Vec<String>,
    /// Directory where recording artifacts land before upload.
    pub recordings_dir: PathBuf,
    /// Route audio to the loudspeaker when the call connects.
    pub speaker_on: bool,
    pub recording_policy: RecordingPolicy,
    /// Handshake timeout for the signaling connect. `None` matches the
    /// original client, which never bounded the handshake.
    pub connect_timeout: Option<Duration>,
    /// Timeout for the unmute consent handshake. With the default `None`
    /// an unanswered request stays pending indefinitely.
    pub unmute_timeout: Option<Duration>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: String::new(),
            api_base_url: String::new(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            recordings_dir: std::env::temp_dir(),
            speaker_on: true,
            recording_policy: RecordingPolicy::default(),
            connect_timeout: None,
            unmute_timeout: None,
        }
    }
}
