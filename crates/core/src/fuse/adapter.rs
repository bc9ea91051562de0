use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    BackgroundSession, FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, Request,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FsEntry, FsError, MediaFs, ROOT_INO};
use crate::reader::MAX_PART_SIZE;
use crate::{APP_NAME, Error, Result};

const ATTR_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    pub allow_other: bool,
    /// Logs every kernel request at debug level.
    pub debug: bool,
}

struct FuseAdapter {
    fs: Arc<MediaFs>,
    runtime: Handle,
    uid: u32,
    gid: u32,
    mounted_at: SystemTime,
    debug: bool,
}

impl FuseAdapter {
    fn root_attr(&self) -> FileAttr {
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: self.mounted_at,
            mtime: self.mounted_at,
            ctime: self.mounted_at,
            crtime: self.mounted_at,
            kind: FileType::Directory,
            perm: 0o555,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: MAX_PART_SIZE as u32,
            flags: 0,
        }
    }

    fn file_attr(&self, entry: &FsEntry) -> FileAttr {
        let created = SystemTime::from(entry.record.created_at);
        let updated = SystemTime::from(entry.record.updated_at);
        let size = entry.size();
        FileAttr {
            ino: entry.ino,
            size,
            blocks: size.div_ceil(512),
            atime: updated,
            mtime: updated,
            ctime: updated,
            crtime: created,
            kind: FileType::RegularFile,
            perm: 0o444,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: MAX_PART_SIZE as u32,
            flags: 0,
        }
    }

    fn trace(&self, op: &str, ino: u64) {
        if self.debug {
            debug!(event = "fuse.request", op, ino, "fuse.request");
        }
    }
}

impl Filesystem for FuseAdapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        self.trace("lookup", parent);
        let Some(name) = name.to_str().filter(|_| parent == ROOT_INO) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.runtime.block_on(self.fs.lookup(name)) {
            Ok(Some(entry)) => reply.entry(&ATTR_TTL, &self.file_attr(&entry), 0),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(FsError::from(e).errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        self.trace("getattr", ino);
        if ino == ROOT_INO {
            reply.attr(&ATTR_TTL, &self.root_attr());
            return;
        }
        match self.runtime.block_on(self.fs.entry(ino)) {
            Ok(Some(entry)) => reply.attr(&ATTR_TTL, &self.file_attr(&entry)),
            Ok(None) => reply.error(libc::ENOENT),
            Err(e) => reply.error(FsError::from(e).errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        self.trace("readdir", ino);
        if ino != ROOT_INO {
            reply.error(libc::ENOTDIR);
            return;
        }
        let entries = match self.runtime.block_on(self.fs.entries()) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(FsError::from(e).errno());
                return;
            }
        };

        let dots = [
            (ROOT_INO, FileType::Directory, "."),
            (ROOT_INO, FileType::Directory, ".."),
        ];
        let listing = dots.into_iter().chain(
            entries
                .iter()
                .map(|e| (e.ino, FileType::RegularFile, e.name.as_str())),
        );
        for (i, (ino, kind, name)) in listing.enumerate().skip(offset.max(0) as usize) {
            if reply.add(ino, i as i64 + 1, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        self.trace("open", ino);
        match self.runtime.block_on(self.fs.open(ino, flags)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        self.trace("read", ino);
        let fs = Arc::clone(&self.fs);
        self.runtime.spawn(async move {
            // fuser does not forward kernel interrupts; only release or
            // unmount cancel a read issued from here.
            let request = CancellationToken::new();
            match fs.read(&request, fh, offset, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.trace("release", ino);
        self.fs.release(fh);
        reply.ok();
    }

    fn destroy(&mut self) {
        self.fs.shutdown();
    }
}

/// A live mount. Dropping it without [`MountedFs::unmount`] still unmounts,
/// but skips the forced cleanup.
pub struct MountedFs {
    fs: Arc<MediaFs>,
    session: Option<BackgroundSession>,
    path: PathBuf,
}

impl MountedFs {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cancels outstanding reads, unmounts, and falls back to a lazy unmount
    /// when the kernel still lists the mount point.
    pub fn unmount(mut self) {
        self.fs.shutdown();
        drop(self.session.take());
        if is_mounted(&self.path) {
            warn!(
                event = "fuse.force_unmount",
                path = %self.path.display(),
                "fuse.force_unmount"
            );
            force_unmount(&self.path);
        }
        info!(event = "fuse.unmounted", path = %self.path.display(), "fuse.unmounted");
    }
}

pub fn mount(fs: Arc<MediaFs>, path: &Path, options: &MountOptions) -> Result<MountedFs> {
    let runtime = Handle::try_current().map_err(|e| Error::InvalidState {
        message: format!("mounting needs a tokio runtime: {e}"),
    })?;
    std::fs::create_dir_all(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;

    let mut mount_options = vec![
        MountOption::RO,
        MountOption::FSName(APP_NAME.to_string()),
        MountOption::NoExec,
        MountOption::NoSuid,
    ];
    if options.allow_other {
        mount_options.push(MountOption::AllowOther);
    }

    // SAFETY: getuid/getgid have no preconditions and cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    let adapter = FuseAdapter {
        fs: Arc::clone(&fs),
        runtime,
        uid,
        gid,
        mounted_at: SystemTime::now(),
        debug: options.debug,
    };
    let session = fuser::spawn_mount2(adapter, path, &mount_options)?;
    info!(
        event = "fuse.mounted",
        path = %path.display(),
        allow_other = options.allow_other,
        "fuse.mounted"
    );
    Ok(MountedFs {
        fs,
        session: Some(session),
        path: path.to_path_buf(),
    })
}

fn is_mounted(path: &Path) -> bool {
    let Ok(mountinfo) = std::fs::read_to_string("/proc/self/mountinfo") else {
        return false;
    };
    let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    mountinfo_lists(&mountinfo, &target)
}

/// Field 5 of each mountinfo line is the mount point.
fn mountinfo_lists(mountinfo: &str, target: &Path) -> bool {
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .any(|point| Path::new(point) == target)
}

fn force_unmount(path: &Path) {
    for (program, flag) in [("fusermount", "-uz"), ("umount", "-l")] {
        match std::process::Command::new(program).arg(flag).arg(path).status() {
            Ok(status) if status.success() => return,
            Ok(status) => debug!(event = "fuse.unmount_cmd_failed", program, %status, "fuse.unmount_cmd_failed"),
            Err(e) => debug!(event = "fuse.unmount_cmd_failed", program, error = %e, "fuse.unmount_cmd_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mountinfo_matches_exact_mount_points() {
        let mountinfo = "\
36 35 98:0 / /mnt/media rw,nosuid - fuse teledrive rw
37 35 98:0 / /mnt/media2 rw - ext4 /dev/sda1 rw
";
        assert!(mountinfo_lists(mountinfo, Path::new("/mnt/media")));
        assert!(!mountinfo_lists(mountinfo, Path::new("/mnt/med")));
        assert!(!mountinfo_lists(mountinfo, Path::new("/srv")));
    }
}
