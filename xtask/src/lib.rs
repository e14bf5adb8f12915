use std::{
    env,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use xshell::Shell;

pub mod manifests;

pub type DynError = Box<dyn std::error::Error>;
pub type Result<T> = std::result::Result<T, DynError>;

pub static CARGO: LazyLock<PathBuf> = LazyLock::new(|| env::var_os("CARGO").unwrap().into());

// Paths:
pub static WORKSPACE: LazyLock<PathBuf> = LazyLock::new(|| {
    Path::new(&env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(1)
        .unwrap()
        .to_path_buf()
});
pub static CONFIG_DIR: LazyLock<PathBuf> = LazyLock::new(|| WORKSPACE.join("config"));

/// Shell constructs an [`xshell::Shell`] rooted at the workspace.
pub fn shell() -> xshell::Result<Shell> {
    let sh = Shell::new()?;
    sh.change_dir(WORKSPACE.as_path());
    Ok(sh)
}

/// Rel renders `p` relative to the workspace root, for friendlier log output.
pub fn rel(p: &Path) -> std::borrow::Cow<'_, str> {
    p.strip_prefix(WORKSPACE.as_path()).unwrap_or(p).to_string_lossy()
}
