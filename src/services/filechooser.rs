use std::{
    ffi::OsStr,
    fs,
    io::ErrorKind,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::bail;
use scopeguard::ScopeGuard;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use zbus::{dbus_interface, fdo, Connection};
use zvariant::OwnedObjectPath;
use zvariant_derive::{DeserializeDict, SerializeDict, Type};

use crate::{
    config::Config,
    picker::{self, CommandPicker, Mode, Picker, PickerRequest},
    session::{self, SessionMemory},
};

use super::request::Request;

const DEFAULT_SAVE_NAME: &str = "Untitled";

pub struct FileChooser {
    connection: Connection,
    dialogs: Dialogs,
}

impl FileChooser {
    pub async fn init(
        connection: &Connection,
        config: Arc<Config>,
        home: Option<PathBuf>,
    ) -> zbus::Result<()> {
        let picker = CommandPicker::new(
            config.command().map(Path::to_path_buf),
            config.postprocess_dir().to_path_buf(),
        );

        let file_chooser = FileChooser {
            connection: connection.clone(),
            dialogs: Dialogs::new(config, Arc::new(picker), SessionMemory::new(home)),
        };

        connection
            .object_server()
            .at(super::PORTAL_PATH, file_chooser)
            .await?;

        log::info!("FileChooser portal enabled.");

        Ok(())
    }
}

/// Turns decoded portal calls into picker invocations and picker output into
/// portal results.
pub struct Dialogs {
    config: Arc<Config>,
    picker: Arc<dyn Picker>,
    memory: SessionMemory,
}

impl Dialogs {
    pub fn new(config: Arc<Config>, picker: Arc<dyn Picker>, memory: SessionMemory) -> Self {
        Self {
            config,
            picker,
            memory,
        }
    }

    async fn run_picker(&mut self, request: PickerRequest) -> anyhow::Result<Vec<PathBuf>> {
        let picker = self.picker.clone();

        // the picker blocks until the user closes the dialog.
        let paths = tokio::task::spawn_blocking(move || picker.pick(&request)).await??;

        if let Some(first) = paths.first() {
            self.memory
                .record_selection(first, self.config.postprocess_dir());
        }

        Ok(paths)
    }

    pub async fn open_file(
        &mut self,
        title: &str,
        options: &OpenFileOptions,
    ) -> anyhow::Result<FileChooserResults> {
        let initial_path = match options.current_folder.as_deref() {
            Some(folder) => path_from_bytes(folder),
            None => self.memory.initial_directory().to_path_buf(),
        };

        let paths = self
            .run_picker(PickerRequest {
                mode: Mode::Open,
                multiple: options.multiple.unwrap_or_default(),
                directory: options.directory.unwrap_or_default(),
                title: title.to_string(),
                initial_path,
            })
            .await?;

        log::trace!("(OpenFile) number of selected files: {}", paths.len());

        Ok(FileChooserResults::from_paths(&paths))
    }

    pub async fn save_file(
        &mut self,
        title: &str,
        options: &SaveFileOptions,
    ) -> anyhow::Result<FileChooserResults> {
        let folder = match options.current_folder.as_deref() {
            Some(folder) => path_from_bytes(folder),
            None => {
                let default_save_dir = self.config.default_save_dir();
                if default_save_dir.as_os_str().is_empty() {
                    bail!("default_save_dir not specified");
                }
                default_save_dir.to_path_buf()
            }
        };

        let name = options.current_name.as_deref().unwrap_or(DEFAULT_SAVE_NAME);

        // whatever the picker left at the candidate path goes away unless the
        // save goes through.
        let candidate = scopeguard::guard(session::resolve_save_path(&folder, name), |path| {
            remove_candidate(&path)
        });

        let paths = self
            .run_picker(PickerRequest {
                mode: Mode::Save,
                multiple: false,
                directory: false,
                title: title.to_string(),
                initial_path: candidate.clone(),
            })
            .await?;

        if paths.is_empty() {
            bail!("no file selected for {}", candidate.display());
        }

        log::trace!("(SaveFile) number of selected files: {}", paths.len());
        ScopeGuard::into_inner(candidate);

        Ok(FileChooserResults::from_paths(&paths))
    }
}

fn remove_candidate(path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => log::debug!("removed unused save candidate {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to remove {}: {}", path.display(), e),
    }
}

// byte string paths from the frontend carry a trailing nul.
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    PathBuf::from(OsStr::from_bytes(&bytes[..end]))
}

#[dbus_interface(name = "org.freedesktop.impl.portal.FileChooser")]
impl FileChooser {
    async fn open_file(
        &mut self,
        handle: OwnedObjectPath,
        app_id: String,
        parent_window: String,
        title: String,
        options: OpenFileOptions,
    ) -> fdo::Result<(ResponseCode, FileChooserResults)> {
        log::debug!("open_file called: ");
        log::debug!("\thandle: {}", handle.as_str());
        log::debug!("\tapp_id: {}", app_id);
        log::debug!("\tparent_window: {}", parent_window);
        log::debug!("\ttitle: {}", title);
        log::debug!("\toptions: {:?}", options);

        let result = Request::scoped(
            &self.connection,
            &handle,
            self.dialogs.open_file(&title, &options),
        )
        .await
        .map_err(|e| fdo::Error::Failed(format!("could not create request: {}", e)))?;

        match result {
            Ok(results) => Ok((ResponseCode::Success, results)),
            Err(e) => {
                log::error!("open_file errored: {:#}", e);
                Err(fdo::Error::Failed(e.to_string()))
            }
        }
    }

    async fn save_file(
        &mut self,
        handle: OwnedObjectPath,
        app_id: String,
        parent_window: String,
        title: String,
        options: SaveFileOptions,
    ) -> fdo::Result<(ResponseCode, FileChooserResults)> {
        log::debug!("save_file called: ");
        log::debug!("\thandle: {}", handle.as_str());
        log::debug!("\tapp_id: {}", app_id);
        log::debug!("\tparent_window: {}", parent_window);
        log::debug!("\ttitle: {}", title);
        log::debug!("\toptions: {:?}", options);

        let result = Request::scoped(
            &self.connection,
            &handle,
            self.dialogs.save_file(&title, &options),
        )
        .await
        .map_err(|e| fdo::Error::Failed(format!("could not create request: {}", e)))?;

        match result {
            Ok(results) => Ok((ResponseCode::Success, results)),
            Err(e) => {
                log::error!("save_file errored: {:#}", e);
                Err(fdo::Error::Failed(e.to_string()))
            }
        }
    }
}

#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, PartialEq, Debug, Type)]
#[repr(u32)]
#[allow(dead_code)]
pub enum ResponseCode {
    Success = 0,
    Cancelled = 1,
    Ended = 2,
}

#[derive(Serialize, Deserialize, Type, Clone, Debug)]
/// A file filter, to limit the available file choices to a mimetype or a glob
/// pattern.
pub struct FileFilter {
    label: String,
    filters: Vec<(FilterType, String)>,
}

#[derive(Serialize_repr, Clone, Deserialize_repr, PartialEq, Debug, Type)]
#[repr(u32)]
#[doc(hidden)]
enum FilterType {
    GlobPattern = 0,
    MimeType = 1,
}

#[derive(DeserializeDict, SerializeDict, Type, Clone, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct OpenFileOptions {
    accept_label: Option<String>,
    modal: Option<bool>,
    multiple: Option<bool>,
    directory: Option<bool>,
    filters: Option<Vec<FileFilter>>,
    current_filter: Option<FileFilter>,
    current_folder: Option<Vec<u8>>,
}

#[derive(DeserializeDict, SerializeDict, Type, Clone, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct SaveFileOptions {
    accept_label: Option<String>,
    modal: Option<bool>,
    current_name: Option<String>,
    current_folder: Option<Vec<u8>>,
}

#[derive(DeserializeDict, SerializeDict, Type, Clone, Debug, Default)]
#[zvariant(signature = "dict")]
pub struct FileChooserResults {
    uris: Vec<String>,
}

impl FileChooserResults {
    fn from_paths(paths: &[PathBuf]) -> Self {
        Self {
            uris: paths.iter().map(|path| picker::to_uri(path)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::picker::tests::write_script;

    /// Hands out a fixed selection and remembers what it was asked for.
    struct FakePicker {
        selection: Vec<PathBuf>,
        requests: Mutex<Vec<PickerRequest>>,
    }

    impl FakePicker {
        fn new(selection: &[&Path]) -> Arc<Self> {
            Arc::new(Self {
                selection: selection.iter().map(|p| p.to_path_buf()).collect(),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn initial_paths(&self) -> Vec<PathBuf> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.initial_path.clone())
                .collect()
        }
    }

    impl Picker for FakePicker {
        fn pick(&self, request: &PickerRequest) -> anyhow::Result<Vec<PathBuf>> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(self.selection.clone())
        }
    }

    fn config(command: Option<PathBuf>, save_dir: &Path) -> Arc<Config> {
        Arc::new(Config::new(
            command,
            save_dir.to_path_buf(),
            PathBuf::from("/tmp/pk_postprocess"),
        ))
    }

    fn command_dialogs(dir: &Path, body: &str) -> Dialogs {
        let script = write_script(dir, "picker.sh", body);
        let config = config(Some(script.clone()), dir);
        let picker = CommandPicker::new(Some(script), config.postprocess_dir().to_path_buf());
        Dialogs::new(config, Arc::new(picker), SessionMemory::new(None))
    }

    fn open_options(multiple: bool, directory: bool) -> OpenFileOptions {
        OpenFileOptions {
            multiple: Some(multiple),
            directory: Some(directory),
            ..Default::default()
        }
    }

    fn save_options(folder: &Path, name: &str) -> SaveFileOptions {
        let mut current_folder = folder.as_os_str().as_bytes().to_vec();
        current_folder.push(0);
        SaveFileOptions {
            current_name: Some(name.to_string()),
            current_folder: Some(current_folder),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_open_file_single_selection() {
        let dir = tempfile::tempdir().unwrap();
        let mut dialogs = command_dialogs(dir.path(), "echo /tmp/x.txt");

        let results = dialogs
            .open_file("Open", &open_options(false, false))
            .await
            .unwrap();
        assert_eq!(results.uris, vec!["file:///tmp/x.txt"]);
    }

    #[tokio::test]
    async fn test_open_file_keeps_line_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut dialogs = command_dialogs(
            dir.path(),
            r#"printf '/tmp/b\n/tmp/a\n/tmp/with space\n'"#,
        );

        let results = dialogs
            .open_file("Open", &open_options(true, false))
            .await
            .unwrap();
        assert_eq!(
            results.uris,
            vec!["file:///tmp/b", "file:///tmp/a", "file:///tmp/with space"]
        );
    }

    #[tokio::test]
    async fn test_open_file_without_output_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut dialogs = command_dialogs(dir.path(), "true");

        let results = dialogs
            .open_file("Open", &open_options(false, false))
            .await
            .unwrap();
        assert!(results.uris.is_empty());
    }

    #[tokio::test]
    async fn test_open_file_without_command_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(None, dir.path());
        let picker = CommandPicker::new(None, config.postprocess_dir().to_path_buf());
        let mut dialogs = Dialogs::new(config, Arc::new(picker), SessionMemory::new(None));

        assert!(dialogs
            .open_file("Open", &open_options(false, false))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_open_file_passes_flags() {
        let dir = tempfile::tempdir().unwrap();
        let mut dialogs = command_dialogs(dir.path(), r#"echo "/$1$2$3""#);

        let results = dialogs
            .open_file("Open", &open_options(true, true))
            .await
            .unwrap();
        assert_eq!(results.uris, vec!["file:///110"]);
    }

    #[tokio::test]
    async fn test_open_file_remembers_last_directory() {
        let root = tempfile::tempdir().unwrap();
        let docs = root.path().join("docs");
        fs::create_dir(&docs).unwrap();
        let selected = docs.join("f.txt");

        let picker = FakePicker::new(&[&selected]);
        let mut dialogs = Dialogs::new(
            config(None, root.path()),
            picker.clone(),
            SessionMemory::new(Some(PathBuf::from("/home/u"))),
        );

        let options = open_options(false, false);
        dialogs.open_file("Open", &options).await.unwrap();
        dialogs.open_file("Open", &options).await.unwrap();

        assert_eq!(
            picker.initial_paths(),
            vec![PathBuf::from("/home/u"), docs]
        );
    }

    #[tokio::test]
    async fn test_open_file_ignores_postprocess_dir() {
        let root = tempfile::tempdir().unwrap();
        let postprocess = root.path().join("pp");
        fs::create_dir(&postprocess).unwrap();

        let picker = FakePicker::new(&[&postprocess.join("converted.png")]);
        let config = Arc::new(Config::new(
            None,
            root.path().to_path_buf(),
            postprocess.clone(),
        ));
        let mut dialogs = Dialogs::new(
            config,
            picker.clone(),
            SessionMemory::new(Some(PathBuf::from("/home/u"))),
        );

        let options = open_options(false, false);
        dialogs.open_file("Open", &options).await.unwrap();
        dialogs.open_file("Open", &options).await.unwrap();

        assert_eq!(
            picker.initial_paths(),
            vec![PathBuf::from("/home/u"), PathBuf::from("/home/u")]
        );
    }

    #[tokio::test]
    async fn test_open_file_current_folder() {
        let picker = FakePicker::new(&[]);
        let mut dialogs = Dialogs::new(
            config(None, Path::new("/tmp")),
            picker.clone(),
            SessionMemory::new(None),
        );

        let options = OpenFileOptions {
            current_folder: Some(b"/srv/media\0".to_vec()),
            ..Default::default()
        };
        dialogs.open_file("Open", &options).await.unwrap();

        assert_eq!(picker.initial_paths(), vec![PathBuf::from("/srv/media")]);
    }

    #[tokio::test]
    async fn test_save_file_echoes_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let mut dialogs = command_dialogs(dir.path(), r#"[ "$3" = 1 ] && echo "$4""#);

        let results = dialogs
            .save_file("Save", &save_options(dir.path(), "report.txt"))
            .await
            .unwrap();
        assert_eq!(
            results.uris,
            vec![format!("file://{}/report.txt", dir.path().display())]
        );
    }

    #[tokio::test]
    async fn test_save_file_avoids_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), "").unwrap();
        fs::write(dir.path().join("a_"), "").unwrap();
        let mut dialogs = command_dialogs(dir.path(), r#"echo "$4""#);

        let results = dialogs
            .save_file("Save", &save_options(dir.path(), "a"))
            .await
            .unwrap();
        assert_eq!(
            results.uris,
            vec![format!("file://{}/a__", dir.path().display())]
        );
    }

    #[tokio::test]
    async fn test_save_file_cancelled_removes_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let mut dialogs = command_dialogs(dir.path(), r#"touch "$4""#);

        let result = dialogs
            .save_file("Save", &save_options(dir.path(), "draft.txt"))
            .await;
        assert!(result.is_err());
        assert!(!dir.path().join("draft.txt").exists());
    }

    #[tokio::test]
    async fn test_save_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let picker = FakePicker::new(&[Path::new("/tmp/saved")]);
        let mut dialogs = Dialogs::new(
            config(None, dir.path()),
            picker.clone(),
            SessionMemory::new(None),
        );

        let results = dialogs
            .save_file("Save", &SaveFileOptions::default())
            .await
            .unwrap();
        assert_eq!(results.uris, vec!["file:///tmp/saved"]);
        assert_eq!(
            picker.initial_paths(),
            vec![dir.path().join(DEFAULT_SAVE_NAME)]
        );
    }

    #[tokio::test]
    async fn test_save_file_absolute_name_stays_in_folder() {
        let dir = tempfile::tempdir().unwrap();
        let picker = FakePicker::new(&[Path::new("/tmp/saved")]);
        let mut dialogs = Dialogs::new(
            config(None, dir.path()),
            picker.clone(),
            SessionMemory::new(None),
        );

        dialogs
            .save_file("Save", &save_options(dir.path(), "/etc/hostname"))
            .await
            .unwrap();
        assert_eq!(
            picker.initial_paths(),
            vec![dir.path().join("etc/hostname")]
        );
    }

    #[tokio::test]
    async fn test_save_file_without_save_dir_fails() {
        let picker = FakePicker::new(&[Path::new("/tmp/saved")]);
        let mut dialogs = Dialogs::new(
            config(None, Path::new("")),
            picker.clone(),
            SessionMemory::new(None),
        );

        assert!(dialogs
            .save_file("Save", &SaveFileOptions::default())
            .await
            .is_err());
        assert!(picker.initial_paths().is_empty());
    }

    #[test]
    fn test_path_from_bytes() {
        assert_eq!(path_from_bytes(b"/tmp/a\0"), PathBuf::from("/tmp/a"));
        assert_eq!(path_from_bytes(b"/tmp/a"), PathBuf::from("/tmp/a"));
        assert_eq!(path_from_bytes(b"/tmp/a\0junk"), PathBuf::from("/tmp/a"));
    }
}
