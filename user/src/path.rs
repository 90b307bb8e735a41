//! Path joining, prefix checks, and working-directory reconstruction for the
//! `cont` CLI's rootpath policy gates (start/resume require the caller's cwd
//! to sit inside the target container's rootpath).

use kernel::abi::{MAXPATH, Stat};
use kernel::fs::{DIRSIZE, Directory, InodeType, ROOTINO};

use crate::syscall::{Fd, OpenFlag, SysError, close, fstat, open, read};

const MAX_DEPTH: usize = 16;

fn copy_into(out: &mut [u8; MAXPATH], at: usize, bytes: &[u8]) -> usize {
    let end = (at + bytes.len()).min(MAXPATH);
    out[at..end].copy_from_slice(&bytes[..end - at]);
    end
}

fn str_from(buf: &[u8; MAXPATH], len: usize) -> &str {
    core::str::from_utf8(&buf[..len]).unwrap_or("")
}

// Collapses `.` and `..` components, matching the original filter_path's
// exact character-advance accounting (a `/.` skips 2, a `/..` skips 3).
fn filter_path(buf: &mut [u8; MAXPATH], len: usize) -> usize {
    let mut idx1 = 0usize;
    let mut idx2 = 0usize;

    while idx2 < len {
        let c0 = buf[idx2];
        let c1 = buf.get(idx2 + 1).copied();
        let c2 = if idx2 + 2 < len {
            Some(buf[idx2 + 2])
        } else {
            None
        };

        if c0 == b'/' && c1 == Some(b'.') && (c2 == Some(b'/') || c2.is_none()) {
            idx2 += 2;
        } else if c0 == b'/' && c1 == Some(b'.') && c2 == Some(b'.') {
            while idx1 > 0 && buf[idx1 - 1] != b'/' {
                idx1 -= 1;
            }
            if idx1 > 1 {
                idx1 -= 1;
            }
            idx2 += 3;
        } else if idx1 > 0 && buf[idx1 - 1] == b'/' && c0 == b'/' {
            idx2 += 1;
        } else {
            buf[idx1] = c0;
            idx1 += 1;
            idx2 += 1;
        }
    }

    idx1
}

/// Joins `base` (always absolute) with `sub` (absolute or relative) and
/// collapses `.`/`..` components, writing the result into `out`.
pub fn concat(base: &str, sub: &str, out: &mut [u8; MAXPATH]) -> usize {
    let n = if sub.as_bytes().first() == Some(&b'/') {
        copy_into(out, 0, sub.as_bytes())
    } else if base == "/" {
        let n = copy_into(out, 0, base.as_bytes());
        copy_into(out, n, sub.as_bytes())
    } else {
        let n = copy_into(out, 0, base.as_bytes());
        let n = copy_into(out, n, b"/");
        copy_into(out, n, sub.as_bytes())
    };

    filter_path(out, n)
}

/// True if `contpath` is a path-component prefix of `fpath` (the root
/// container's path, `/`, is a prefix of everything).
pub fn is_prefix(fpath: &str, contpath: &str) -> bool {
    if contpath == "/" {
        return true;
    }

    let f = fpath.as_bytes();
    let c = contpath.as_bytes();
    let mut idx = 0;
    while idx < f.len() && idx < c.len() {
        if f[idx] != c[idx] {
            return false;
        }
        idx += 1;
    }

    idx == c.len() && (idx == f.len() || f[idx] == b'/')
}

fn stat_ino(path: &str) -> Result<u32, SysError> {
    let fd = open(path, OpenFlag::READ_ONLY)?;
    let mut st = Stat {
        dev: 0,
        ino: 0,
        r#type: InodeType::Free,
        nlink: 0,
        size: 0,
    };
    let result = fstat(fd, &mut st);
    close(fd)?;
    result?;
    Ok(st.ino)
}

fn scan_for_inum(fd: Fd, target: u32, name_out: &mut [u8; DIRSIZE]) -> Result<usize, SysError> {
    loop {
        let mut dirent = Directory::new_empty();
        let bytes = unsafe {
            core::slice::from_raw_parts_mut(&mut dirent as *mut Directory as *mut u8, Directory::SIZE)
        };
        let n = read(fd, bytes)?;
        if n != Directory::SIZE {
            return Err(SysError::InvalidPath);
        }
        if dirent.inum as u32 == target {
            let len = dirent.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZE);
            name_out[..len].copy_from_slice(&dirent.name[..len]);
            return Ok(len);
        }
    }
}

/// Reconstructs the caller's absolute working directory by walking `..`
/// links from `.` up to the root, matching each step's inode number against
/// a directory entry in its parent. Writes the result into `out`.
pub fn pwd(out: &mut [u8; MAXPATH]) -> Result<usize, SysError> {
    let mut names: [[u8; DIRSIZE]; MAX_DEPTH] = [[0; DIRSIZE]; MAX_DEPTH];
    let mut name_lens: [usize; MAX_DEPTH] = [0; MAX_DEPTH];
    let mut depth = 0;

    let mut cur_path = [0u8; MAXPATH];
    let mut cur_len = copy_into(&mut cur_path, 0, b".");
    let mut cur_ino = stat_ino(str_from(&cur_path, cur_len))?;

    while cur_ino != ROOTINO {
        if depth >= MAX_DEPTH {
            return Err(SysError::InvalidPath);
        }

        cur_len = copy_into(&mut cur_path, cur_len, b"/..");
        let parent_path = str_from(&cur_path, cur_len);
        let parent_ino = stat_ino(parent_path)?;

        let fd = open(parent_path, OpenFlag::READ_ONLY)?;
        let found = scan_for_inum(fd, cur_ino, &mut names[depth]);
        close(fd)?;
        name_lens[depth] = found?;
        depth += 1;

        cur_ino = parent_ino;
    }

    let mut n = 0usize;
    if depth == 0 {
        out[0] = b'/';
        n = 1;
    } else {
        for i in (0..depth).rev() {
            out[n] = b'/';
            n += 1;
            let len = name_lens[i];
            out[n..n + len].copy_from_slice(&names[i][..len]);
            n += len;
        }
    }

    Ok(n)
}
