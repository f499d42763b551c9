//! Edge-triggered sound alert driven by the latest danger state.

use std::{
    io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detection::DangerState;

#[derive(Debug, Error)]
pub enum SoundError {
    #[error("alert sound {0:?} not found")]
    Missing(PathBuf),
    #[error("failed to start audio player {player:?}")]
    Spawn {
        player: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to stop audio player")]
    Stop(#[source] io::Error),
}

/// Looping alert sound. Both calls must be idempotent.
pub trait SoundActuator: Send {
    fn start_loop(&mut self) -> Result<(), SoundError>;
    fn stop(&mut self) -> Result<(), SoundError>;
}

impl<S: SoundActuator + ?Sized> SoundActuator for Box<S> {
    fn start_loop(&mut self) -> Result<(), SoundError> {
        (**self).start_loop()
    }

    fn stop(&mut self) -> Result<(), SoundError> {
        (**self).stop()
    }
}

/// Used when sound is disabled or failed to initialise.
#[derive(Debug, Default)]
pub struct SilentSound;

impl SoundActuator for SilentSound {
    fn start_loop(&mut self) -> Result<(), SoundError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SoundError> {
        Ok(())
    }
}

/// Plays a sound file on repeat through `ffplay`.
pub struct PlayerSound {
    player: String,
    path: PathBuf,
    volume: u8,
    child: Option<Child>,
}

impl PlayerSound {
    pub fn new(path: impl AsRef<Path>, volume: u8) -> Result<Self, SoundError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SoundError::Missing(path.to_path_buf()));
        }
        Ok(Self {
            player: "ffplay".to_string(),
            path: path.to_path_buf(),
            volume: volume.min(100),
            child: None,
        })
    }

    fn is_playing(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!("Audio player exited with {status}");
                self.child = None;
                false
            }
            Some(Err(_)) | None => false,
        }
    }
}

impl SoundActuator for PlayerSound {
    fn start_loop(&mut self) -> Result<(), SoundError> {
        if self.is_playing() {
            return Ok(());
        }
        let child = Command::new(&self.player)
            .args(["-nodisp", "-loglevel", "quiet", "-loop", "0", "-volume"])
            .arg(self.volume.to_string())
            .arg(&self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| SoundError::Spawn {
                player: self.player.clone(),
                source,
            })?;
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), SoundError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if let Err(err) = child.kill() {
            if err.kind() != io::ErrorKind::InvalidInput {
                return Err(SoundError::Stop(err));
            }
        }
        child.wait().map_err(SoundError::Stop)?;
        Ok(())
    }
}

impl Drop for PlayerSound {
    fn drop(&mut self) {
        let _ = SoundActuator::stop(self);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertAction {
    Started,
    Stopped,
    Unchanged,
}

/// Starts the sound when danger appears and stops it as soon as it clears.
pub struct AlertController<S> {
    sound: S,
    active: bool,
}

impl<S: SoundActuator> AlertController<S> {
    pub fn new(sound: S) -> Self {
        Self {
            sound,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn update(&mut self, state: DangerState) -> AlertAction {
        match (self.active, state) {
            (false, DangerState::Present) => {
                if let Err(err) = self.sound.start_loop() {
                    warn!("Failed to start alert sound: {err}");
                }
                self.active = true;
                AlertAction::Started
            }
            (true, DangerState::Absent) => {
                if let Err(err) = self.sound.stop() {
                    warn!("Failed to stop alert sound: {err}");
                }
                self.active = false;
                AlertAction::Stopped
            }
            _ => AlertAction::Unchanged,
        }
    }

    /// Stop any playing sound, e.g. on shutdown.
    pub fn silence(&mut self) {
        if self.active {
            info!("Silencing alert sound");
        }
        self.update(DangerState::Absent);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl SoundActuator for Recorder {
        fn start_loop(&mut self) -> Result<(), SoundError> {
            self.0.lock().unwrap().push("start");
            Ok(())
        }

        fn stop(&mut self) -> Result<(), SoundError> {
            self.0.lock().unwrap().push("stop");
            Ok(())
        }
    }

    #[test]
    fn persistent_danger_starts_sound_once() {
        let recorder = Recorder::default();
        let mut alert = AlertController::new(recorder.clone());
        let states = [
            DangerState::Absent,
            DangerState::Present,
            DangerState::Present,
            DangerState::Present,
            DangerState::Absent,
        ];
        let actions: Vec<_> = states.iter().map(|s| alert.update(*s)).collect();

        assert_eq!(*recorder.0.lock().unwrap(), vec!["start", "stop"]);
        assert_eq!(
            actions,
            vec![
                AlertAction::Unchanged,
                AlertAction::Started,
                AlertAction::Unchanged,
                AlertAction::Unchanged,
                AlertAction::Stopped,
            ]
        );
        assert!(!alert.is_active());
    }

    #[test]
    fn silence_is_a_noop_when_inactive() {
        let recorder = Recorder::default();
        let mut alert = AlertController::new(recorder.clone());
        alert.silence();
        assert!(recorder.0.lock().unwrap().is_empty());

        alert.update(DangerState::Present);
        alert.silence();
        assert_eq!(*recorder.0.lock().unwrap(), vec!["start", "stop"]);
    }

    #[test]
    fn player_sound_requires_an_existing_file() {
        let err = PlayerSound::new("/definitely/not/here.mp3", 50)
            .err()
            .expect("missing file rejected");
        assert!(matches!(err, SoundError::Missing(_)));
    }

    #[test]
    fn silent_sound_is_idempotent() {
        let mut sound = SilentSound;
        assert!(sound.start_loop().is_ok());
        assert!(sound.start_loop().is_ok());
        assert!(sound.stop().is_ok());
        assert!(sound.stop().is_ok());
    }
}
