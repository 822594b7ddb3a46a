//! Frame sources. A source is opened once, read by a single loop and released
//! exactly once through [`SourceGuard`].

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::engine::RegistrationError;
use crate::image_impl::{imread, Frame};

const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

#[derive(Debug, Clone, PartialEq)]
pub enum FrameRead {
    Frame(Frame),
    /// One frame could not be decoded; the source may still deliver more.
    Failed(String),
    EndOfStream,
}

/// Capture-style frame source: `grab` advances, `retrieve` decodes the last
/// grabbed frame.
pub trait FrameSource {
    /// Advances to the next frame. Returns false when nothing was grabbed.
    fn grab(&mut self) -> bool;

    /// Decodes the most recently grabbed frame.
    fn retrieve(&mut self) -> FrameRead;

    fn read(&mut self) -> FrameRead {
        if self.grab() {
            self.retrieve()
        } else {
            FrameRead::EndOfStream
        }
    }

    fn release(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for &mut S {
    fn grab(&mut self) -> bool {
        (**self).grab()
    }

    fn retrieve(&mut self) -> FrameRead {
        (**self).retrieve()
    }

    fn read(&mut self) -> FrameRead {
        (**self).read()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Drains up to `drain` queued frames and returns the newest. Falls back to a
/// plain read when the grabbed frame cannot be retrieved.
pub fn grab_latest_frame<S: FrameSource + ?Sized>(source: &mut S, drain: usize) -> FrameRead {
    let mut grabbed = 0;
    for _ in 0..drain {
        if source.grab() {
            grabbed += 1;
        }
    }
    if grabbed > 0 {
        if let FrameRead::Frame(frame) = source.retrieve() {
            return FrameRead::Frame(frame);
        }
    }
    source.read()
}

/// Releases the wrapped source when dropped.
pub struct SourceGuard<S: FrameSource> {
    source: S,
}

impl<S: FrameSource> SourceGuard<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: FrameSource> Deref for SourceGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.source
    }
}

impl<S: FrameSource> DerefMut for SourceGuard<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

impl<S: FrameSource> Drop for SourceGuard<S> {
    fn drop(&mut self) {
        self.source.release();
    }
}

/// Still images of a directory, in lexicographic file name order.
#[derive(Debug)]
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next: usize,
    current: Option<PathBuf>,
    released: bool,
}

impl ImageSequenceSource {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, RegistrationError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| RegistrationError::SourceUnavailable(format!("{}: {e}", dir.display())))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(RegistrationError::SourceUnavailable(format!(
                "{}: no image files",
                dir.display()
            )));
        }
        debug!("opened {} frames from {}", paths.len(), dir.display());
        Ok(Self::from_paths(paths))
    }

    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            next: 0,
            current: None,
            released: false,
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}

impl FrameSource for ImageSequenceSource {
    fn grab(&mut self) -> bool {
        if self.released || self.next >= self.paths.len() {
            return false;
        }
        self.current = Some(self.paths[self.next].clone());
        self.next += 1;
        true
    }

    fn retrieve(&mut self) -> FrameRead {
        let Some(path) = self.current.take() else {
            return FrameRead::EndOfStream;
        };
        match imread(&path) {
            Ok(frame) => FrameRead::Frame(frame),
            Err(e) => FrameRead::Failed(format!("{}: {e}", path.display())),
        }
    }

    fn release(&mut self) {
        if !self.released {
            debug!("releasing image sequence after {} of {} frames", self.next, self.paths.len());
        }
        self.released = true;
        self.current = None;
    }
}

/// Frames held in memory; `None` entries simulate decode failures.
#[derive(Debug, Default)]
pub struct MemorySource {
    frames: VecDeque<Option<Frame>>,
    current: Option<Option<Frame>>,
    release_count: usize,
}

impl MemorySource {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self::with_failures(frames.into_iter().map(Some))
    }

    pub fn with_failures(frames: impl IntoIterator<Item = Option<Frame>>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            current: None,
            release_count: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }

    pub fn release_count(&self) -> usize {
        self.release_count
    }
}

impl FrameSource for MemorySource {
    fn grab(&mut self) -> bool {
        match self.frames.pop_front() {
            Some(frame) => {
                self.current = Some(frame);
                true
            }
            None => false,
        }
    }

    fn retrieve(&mut self) -> FrameRead {
        match self.current.take() {
            Some(Some(frame)) => FrameRead::Frame(frame),
            Some(None) => FrameRead::Failed("frame could not be decoded".to_string()),
            None => FrameRead::EndOfStream,
        }
    }

    fn release(&mut self) {
        if self.release_count > 0 {
            warn!("memory source released more than once");
        }
        self.release_count += 1;
        self.frames.clear();
    }
}
