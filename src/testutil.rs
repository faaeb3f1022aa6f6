use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::sys::stat::Mode as FileMode;
use nix::unistd::mkfifo;

use crate::sysfs::SysfsGateway;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Throwaway directory laid out like `/sys/class/gpio`.
pub struct FakeSysfs {
    root: PathBuf,
}

impl FakeSysfs {
    pub fn new(name: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "sysgpio-{name}-{}-{}",
            std::process::id(),
            NEXT_ID.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("export"), "").unwrap();
        fs::write(root.join("unexport"), "").unwrap();
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn gateway(&self) -> SysfsGateway {
        SysfsGateway::new(&self.root)
    }

    /// Creates an already exported line in input mode reading low.
    pub fn add_line(&self, line: u32) {
        let dir = self.root.join(format!("gpio{line}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("direction"), "in\n").unwrap();
        fs::write(dir.join("edge"), "none\n").unwrap();
        fs::write(dir.join("value"), "0\n").unwrap();
    }

    /// Like `add_line`, but `value` is a FIFO so it can sit in an epoll set.
    pub fn add_fifo_line(&self, line: u32) {
        let dir = self.root.join(format!("gpio{line}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("direction"), "in\n").unwrap();
        fs::write(dir.join("edge"), "none\n").unwrap();
        mkfifo(&dir.join("value"), FileMode::S_IRUSR | FileMode::S_IWUSR).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.root.join(rel))
            .unwrap()
            .trim()
            .to_string()
    }

    pub fn write(&self, rel: &str, contents: &str) {
        fs::write(self.root.join(rel), contents).unwrap();
    }
}

impl Drop for FakeSysfs {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}
