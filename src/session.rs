use std::path::{Path, PathBuf};

/// State kept between picker invocations for the lifetime of the process.
#[derive(Debug, Default)]
pub struct SessionMemory {
    home: Option<PathBuf>,
    last_directory: Option<PathBuf>,
}

impl SessionMemory {
    pub fn new(home: Option<PathBuf>) -> Self {
        Self {
            home,
            last_directory: None,
        }
    }

    /// The directory the picker should open in when the caller didn't ask for
    /// one. Seeded from the home directory on first use.
    pub fn initial_directory(&mut self) -> &Path {
        let home = &self.home;
        self.last_directory
            .get_or_insert_with(|| home.clone().unwrap_or_default())
    }

    pub fn record(&mut self, directory: PathBuf) {
        log::debug!("session: last directory is now {}", directory.display());
        self.last_directory = Some(directory);
    }

    /// Remembers the directory containing `first`, unless it is the root, the
    /// picker's post-processing directory or no longer exists.
    pub fn record_selection(&mut self, first: &Path, postprocess_dir: &Path) {
        let directory = match first.parent() {
            Some(directory) if !directory.as_os_str().is_empty() && directory != Path::new("/") => {
                directory
            }
            _ => return,
        };

        if directory == postprocess_dir || !directory.is_dir() {
            return;
        }

        self.record(directory.to_path_buf());
    }
}

/// Returns `folder/name`, appending `_` until nothing exists at the resulting
/// path. `name` is never treated as absolute, so the result stays in `folder`.
pub fn resolve_save_path(folder: &Path, name: &str) -> PathBuf {
    let mut candidate = folder.as_os_str().to_os_string();
    candidate.push("/");
    candidate.push(name);

    while Path::new(&candidate).exists() {
        candidate.push("_");
    }

    PathBuf::from(candidate)
}
