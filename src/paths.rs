// DOS file names to host file names and back. DOS sees 8.3 uppercase
// names; the host directory may contain anything, so every host entry is
// coined into a unique 8.3 alias (invalid chars become '~', collisions
// get a shrinking base plus a decimal '~N' tail) and searches run over
// the coined list. Resolution tries the cheap exact/uppercase/lowercase
// candidates before paying for a full directory scan.

use std::fs;
use std::path::{Path, PathBuf};

/// One directory entry as DOS sees it: the coined 8.3 name plus the host
/// path. Volume-label entries carry no host path.
#[derive(Debug, Clone)]
pub struct DosFile {
    pub dos: String,
    pub host: Option<PathBuf>,
}

/// Characters DOS accepts in a file name, folding lowercase to upper.
pub fn valid_char(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' | b'A'..=b'Z' => Some(c),
        b'a'..=b'z' => Some(c - b'a' + b'A'),
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'(' | b')' | b'-' | b'@' | b'^' | b'_'
        | b'{' | b'}' | b'~' => Some(c),
        _ => None,
    }
}

/// Convert a host name to its raw 8.3 form. Returns the name bytes and
/// the length of the base part (0 means nothing usable).
fn host_to_dos(name: &str) -> (Vec<u8>, usize) {
    let u = name.as_bytes();
    let mut d = Vec::with_capacity(13);
    let mut i = 0;
    while i < u.len() && u[i] != b'.' && d.len() < 8 {
        d.push(valid_char(u[i]).unwrap_or(b'~'));
        i += 1;
    }
    let dot = d.len();
    while i < u.len() && u[i] != b'.' {
        i += 1;
    }
    if i < u.len() && i + 1 < u.len() {
        d.push(b'.');
        i += 1;
        let mut k = 0;
        while i < u.len() && k < 3 {
            d.push(valid_char(u[i]).unwrap_or(b'~'));
            i += 1;
            k += 1;
        }
    }
    (d, dot)
}

/// How many list entries carry exactly this coined name.
pub fn search_name(list: &[DosFile], name: &str) -> usize {
    list.iter().filter(|f| f.dos == name).count()
}

fn search_host_name<'a>(list: &'a [DosFile], host: &Path) -> Option<&'a DosFile> {
    list.iter().find(|f| f.host.as_deref() == Some(host))
}

/// Sort host names so entries sharing a DOS form come out in a stable
/// order: shorter first, then '.' and '~' before other characters.
fn dos_order(n1: &str, n2: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering::*;
    let b1 = n1.as_bytes();
    let b2 = n2.as_bytes();
    let mut i = 0;
    let mut j = 0;
    loop {
        let c1 = b1.get(i).copied();
        let c2 = b2.get(j).copied();
        let v1 = c1.and_then(valid_char);
        let v2 = c2.and_then(valid_char);
        if v1.is_some() && v1 == v2 {
            i += 1;
            j += 1;
            continue;
        }
        if c1.is_some() && c1 == c2 {
            i += 1;
            j += 1;
            continue;
        }
        return match (c1, c2) {
            (None, None) => n1.cmp(n2),
            (None, _) => Less,
            (_, None) => Greater,
            (Some(a), Some(b)) => {
                if a == b'.' {
                    Less
                } else if b == b'.' {
                    Greater
                } else if a == b'~' {
                    Less
                } else if b == b'~' {
                    Greater
                } else {
                    match (v1, v2) {
                        (None, None) => a.cmp(&b),
                        (None, _) => Greater,
                        (_, None) => Less,
                        (Some(x), Some(y)) => x.cmp(&y),
                    }
                }
            }
        };
    }
}

/// Match a coined DOS name against a user pattern. '*' eats any run of
/// valid characters up to the dot, '?' exactly one; trailing '*', '?'
/// and '.' in the pattern are satisfied by an exhausted name.
pub fn glob_match(name: &str, pattern: &str) -> bool {
    let n = name.as_bytes();
    let g = pattern.as_bytes();
    let mut i = 0;
    let mut j = 0;
    while i < n.len() && j < g.len() {
        let cn = n[i];
        let cg = g[j];
        if cg == b'*' {
            if cn == b'.' {
                j += 1;
            } else {
                i += 1;
            }
            continue;
        }
        if cg == b'?' {
            j += 1;
            if cn != b'.' {
                i += 1;
            }
            continue;
        }
        let cg = if cg.is_ascii_lowercase() { cg - b'a' + b'A' } else { cg };
        let cn = if cn.is_ascii_lowercase() { cn - b'a' + b'A' } else { cn };
        if cg == cn {
            i += 1;
            j += 1;
            continue;
        }
        return false;
    }
    while j < g.len() && (g[j] == b'*' || g[j] == b'?' || g[j] == b'.') {
        j += 1;
    }
    i == n.len() && j == g.len()
}

/// Read a host directory, coin every entry into a unique 8.3 name, and
/// keep those matching the glob pattern.
pub fn read_dir_dos(path: &Path, glob: &str) -> Vec<DosFile> {
    let rd = match fs::read_dir(if path.as_os_str().is_empty() { Path::new("/") } else { path }) {
        Ok(rd) => rd,
        Err(_) => return Vec::new(),
    };
    let mut names: Vec<String> = rd
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort_by(|a, b| dos_order(a, b));

    let mut list: Vec<DosFile> = Vec::with_capacity(names.len());
    for name in names {
        if name.starts_with('.') {
            continue;
        }
        let (mut dosname, dot) = host_to_dos(&name);
        if dot == 0 {
            continue;
        }
        // Append a '~N' tail, shrinking the base, until the name is
        // unique within this directory.
        let mut pos = dot;
        let mut n = 0usize;
        let mut max = 0usize;
        while pos > 0 && search_name(&list, std::str::from_utf8(&dosname).unwrap_or("")) > 0 {
            if n >= max {
                pos -= 1;
                max = if max == 0 { 1 } else { max * 10 };
                n = 0;
                dosname[pos] = b'~';
            }
            let mut k = pos + 1;
            let mut d = max / 10;
            while d > 0 {
                dosname[k] = b'0' + ((n / d) % 10) as u8;
                d /= 10;
                k += 1;
            }
            n += 1;
        }
        if pos == 0 {
            continue;
        }
        let dos = match std::str::from_utf8(&dosname) {
            Ok(s) => s.to_string(),
            Err(_) => continue,
        };
        list.push(DosFile { dos, host: Some(path.join(&name)) });
    }
    list.retain(|f| glob_match(&f.dos, glob));
    list
}

/// Resolve one DOS name inside a host directory. Tries the literal name,
/// then case variants, then a full scan against the coined names. With
/// `force` a missing file yields the lowercase candidate so creation can
/// proceed.
fn resolve_name(path: &str, dos_name: &str, force: bool) -> Option<String> {
    let bpath = if path == "/" { "" } else { path };
    let candidate = format!("{}/{}", bpath, dos_name);
    if fs::symlink_metadata(&candidate).is_ok() {
        return Some(candidate);
    }
    // Keep glob patterns unexpanded; the caller splits them off.
    if dos_name.contains('?') || dos_name.contains('*') {
        return Some(candidate);
    }
    let upper = format!("{}/{}", bpath, dos_name.to_ascii_uppercase());
    if fs::symlink_metadata(&upper).is_ok() {
        return Some(upper);
    }
    let lower = format!("{}/{}", bpath, dos_name.to_ascii_lowercase());
    if fs::symlink_metadata(&lower).is_ok() {
        return Some(lower);
    }
    let list = read_dir_dos(Path::new(bpath), dos_name);
    match list.iter().find_map(|f| f.host.clone()) {
        Some(host) => host.to_str().map(str::to_string),
        None if force => Some(lower),
        None => None,
    }
}

/// Convert a normalized DOS path to a host path, component by component.
fn resolve_path(base: &str, dospath: &str, force: bool) -> Option<String> {
    match dospath.rfind(|c| c == '\\' || c == '/') {
        None => resolve_name(base, dospath, force),
        Some(p) => {
            let parent = resolve_path(base, &dospath[..p], force)?;
            resolve_name(&parent, &dospath[p + 1..], force)
        }
    }
}

fn char_valid(c: u8) -> bool {
    c >= 32 && c != b'/' && c != b'\\'
}

fn char_pathsep(c: u8) -> bool {
    c == b'/' || c == b'\\'
}

/// Per-drive working directories plus the default drive; the whole of
/// the guest's idea of "where am I".
pub struct DosFs {
    cwd: [[u8; 64]; 26],
    default_drive: usize,
}

impl DosFs {
    pub fn new() -> DosFs {
        DosFs { cwd: [[0; 64]; 26], default_drive: 2 }
    }

    pub fn set_default_drive(&mut self, drive: usize) {
        if drive < 26 {
            self.default_drive = drive;
        }
    }

    pub fn default_drive(&self) -> usize {
        self.default_drive
    }

    /// CWD of a DL-style drive number: 0 = default, 1 = A:.
    pub fn cwd_for(&self, dl: u8) -> &[u8; 64] {
        let drive = if dl == 0 { self.default_drive } else { (dl - 1) as usize % 26 };
        &self.cwd[drive]
    }

    fn cwd_str(&self, drive: usize) -> String {
        let buf = &self.cwd[drive];
        let len = buf.iter().position(|&c| c == 0).unwrap_or(64);
        String::from_utf8_lossy(&buf[..len]).into_owned()
    }

    /// Host base directory for a drive, from EMU2_DRIVE_<letter>.
    pub fn base_path(&self, drive: usize) -> String {
        let var = format!("EMU2_DRIVE_{}", (b'A' + drive as u8) as char);
        std::env::var(var).unwrap_or_else(|_| ".".to_string())
    }

    /// Normalize a DOS path: strip the drive, make absolute against the
    /// per-drive CWD, fold '.' and '..'. Output fits 63 bytes.
    pub fn normalize(&self, input: &str) -> (usize, String) {
        let mut path: Vec<u8> = input.bytes().take(63).collect();
        let mut drive = self.default_drive;

        if path.len() >= 2 && path[1] == b':' {
            let d = path[0];
            drive = match d {
                b'A'..=b'Z' => (d - b'A') as usize,
                b'a'..=b'z' => (d - b'a') as usize,
                _ => self.default_drive,
            };
            path.drain(..2);
        }

        let mut base: Vec<u8> = if path.first().map_or(false, |&c| char_pathsep(c)) {
            Vec::new()
        } else {
            self.cwd_str(drive).into_bytes()
        };

        let mut end = 0;
        while end < path.len() {
            let beg = end;
            while end < path.len() && char_valid(path[end]) {
                end += 1;
            }
            if end < path.len() && !char_pathsep(path[end]) {
                break;
            }
            let comp = &path[beg..end];
            if comp == b".." {
                // Up a directory.
                while base.last().map_or(false, |&c| !char_pathsep(c)) {
                    base.pop();
                }
                while base.last().map_or(false, |&c| char_pathsep(c)) {
                    base.pop();
                }
            } else if !comp.is_empty() && comp != b"." {
                if base.len() < 63 {
                    if !base.is_empty() {
                        base.push(b'\\');
                    }
                    let mut k = 0;
                    while base.len() < 62 && k < comp.len() {
                        base.push(comp[k]);
                        k += 1;
                    }
                }
            }
            end += 1;
        }
        base.truncate(63);
        (drive, String::from_utf8_lossy(&base).into_owned())
    }

    fn unix_path_normalized(&self, drive: usize, path: &str, force: bool) -> Option<PathBuf> {
        let base = self.base_path(drive);
        resolve_path(&base, path, force).map(PathBuf::from)
    }

    /// Convert a full DOS path to a host path. `force` makes creation
    /// possible by inventing a lowercase name for a missing final
    /// component; `append` is the EMU2_APPEND search list.
    pub fn unix_path(&self, dospath: &str, force: bool, append: Option<&str>) -> Option<PathBuf> {
        log::debug!(target: "dos", "\tconvert dos path '{}'", dospath);
        // Character devices resolve to their host equivalents.
        let updev = dospath.to_ascii_uppercase();
        if updev == "NUL" || (updev.len() == 5 && updev.ends_with(":NUL")) {
            return Some(PathBuf::from("/dev/null"));
        }
        if updev == "CON" || (updev.len() == 5 && updev.ends_with(":CON")) {
            return Some(PathBuf::from("/dev/tty"));
        }
        let (drive, norm) = self.normalize(dospath);
        if let Some(found) = self.unix_path_normalized(drive, &norm, force) {
            return Some(found);
        }
        let append = append?;
        // Don't search the append list for absolute or drive-qualified
        // paths.
        let b = dospath.as_bytes();
        if b.first().map_or(true, |&c| !char_valid(c)) {
            return None;
        }
        if b.len() >= 3 && b[1] == b':' && !char_valid(b[2]) {
            return None;
        }
        self.search_append(dospath, append)
    }

    fn search_append(&self, path: &str, append: &str) -> Option<PathBuf> {
        for prefix in append.split(';').filter(|s| !s.is_empty()) {
            let full = format!("{}\\{}", prefix, path);
            if full.len() < 64 {
                log::debug!(target: "dos", "\tconvert dos path '{}'", full);
                let (drive, norm) = self.normalize(&full);
                if let Some(found) = self.unix_path_normalized(drive, &norm, false) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Build the "name.ext" form from an FCB's drive byte and 11-byte
    /// name field, keeping '?' wildcards.
    pub fn fcb_file_name(name11: &[u8]) -> String {
        let mut out = Vec::new();
        for &c in &name11[..8] {
            if c == b'?' {
                out.push(b'?');
            } else {
                match valid_char(c) {
                    Some(v) => out.push(v),
                    None => break,
                }
            }
        }
        if name11[8] == b'?' || valid_char(name11[8]).is_some() {
            out.push(b'.');
            for &c in &name11[8..11] {
                if c == b'?' {
                    out.push(b'?');
                } else {
                    match valid_char(c) {
                        Some(v) => out.push(v),
                        None => break,
                    }
                }
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Convert an FCB drive+name pair to a host path.
    pub fn unix_path_fcb(
        &self,
        fcb_drive: u8,
        name11: &[u8],
        force: bool,
        append: Option<&str>,
    ) -> Option<PathBuf> {
        let (drive, append) = if fcb_drive == 0 {
            (self.default_drive, append)
        } else {
            // An explicit drive disables the append search.
            (((fcb_drive - 1) as usize) % 26, None)
        };
        let filename = Self::fcb_file_name(name11);
        log::debug!(target: "dos", "\tconvert dos fcb name {}:'{}'",
            (b'A' + drive as u8) as char, filename);
        let path = format!("{}\\{}", self.cwd_str(drive), filename);
        if path.len() >= 64 {
            return None;
        }
        let base = self.base_path(drive);
        if let Some(found) = resolve_path(&base, &path, force) {
            return Some(PathBuf::from(found));
        }
        let append = append?;
        self.search_append(&filename, append)
    }

    /// Change the per-drive CWD after validating the target directory.
    pub fn change_cwd(&mut self, path: &str) -> bool {
        log::debug!(target: "dos", "\tchdir '{}'", path);
        let (drive, norm) = self.normalize(path);
        let host = match self.unix_path_normalized(drive, &norm, false) {
            Some(h) => h,
            None => return false,
        };
        match fs::metadata(&host) {
            Ok(md) if md.is_dir() => {}
            _ => return false,
        }
        let mut buf = [0u8; 64];
        for (i, &b) in norm.as_bytes().iter().take(63).enumerate() {
            buf[i] = b;
        }
        self.cwd[drive] = buf;
        true
    }

    /// Express a host path as a DOS path under the drive's base, coining
    /// each component. None when the path escapes the base directory.
    pub fn real_path(&self, drive: usize, host: &str) -> Option<String> {
        let base = fs::canonicalize(self.base_path(drive)).ok()?;
        let path = fs::canonicalize(host).ok()?;
        log::debug!(target: "dos", "dos_real_path: base='{}' path='{}'",
            base.display(), path.display());
        let rel = match path.strip_prefix(&base) {
            Ok(r) => r,
            Err(_) => {
                log::debug!(target: "dos", "dos_real_path: no common base");
                return None;
            }
        };
        let mut ret = String::from("C:");
        let mut cur = base.clone();
        for comp in rel.components() {
            let name = comp.as_os_str();
            let fl = read_dir_dos(&cur, "*.*");
            cur = cur.join(name);
            let found = search_host_name(&fl, &cur)?;
            ret.push('\\');
            ret.push_str(&found.dos);
            if ret.len() > 64 {
                log::debug!(target: "dos", "dos_real_path: path too long for DOS");
                return None;
            }
        }
        Some(ret)
    }

    /// Materialize the listing for a find-first call: resolve the
    /// directory part, then scan it with the glob tail.
    pub fn find_first_list(&self, dospath: &str) -> Vec<DosFile> {
        let fspec = match self.unix_path(dospath, true, None) {
            Some(p) => p,
            None => return Vec::new(),
        };
        Self::find_first_host(&fspec)
    }

    pub fn find_first_list_fcb(&self, fcb_drive: u8, name11: &[u8]) -> Vec<DosFile> {
        let fspec = match self.unix_path_fcb(fcb_drive, name11, true, None) {
            Some(p) => p,
            None => return Vec::new(),
        };
        Self::find_first_host(&fspec)
    }

    fn find_first_host(fspec: &Path) -> Vec<DosFile> {
        let s = fspec.to_string_lossy();
        let (dir, glob) = match s.rfind('/') {
            Some(p) => (&s[..p], &s[p + 1..]),
            None => (".", &s[..]),
        };
        log::debug!(target: "dos", "\tfind_first '{}' at '{}'", glob, dir);
        read_dir_dos(Path::new(dir), glob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_rules() {
        assert!(glob_match("README.TXT", "*.*"));
        assert!(glob_match("README", "*.*"));
        assert!(glob_match("README.TXT", "README*.*"));
        assert!(glob_match("README.TXT", "readme.txt"));
        assert!(glob_match("A.B", "?.?"));
        assert!(!glob_match("AB.B", "?.?"));
        assert!(!glob_match("README.TXT", "*.DOC"));
        assert!(glob_match("NOEXT", "NOEXT."));
        assert!(!glob_match("X.Y", "X"));
    }

    #[test]
    fn coined_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["name_one.txt", "name_two.txt", "name_three.txt", "NAME_FOUR.TXT"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let list = read_dir_dos(dir.path(), "*.*");
        assert_eq!(list.len(), 4);
        for f in &list {
            assert_eq!(search_name(&list, &f.dos), 1, "{} not unique", f.dos);
        }
    }

    #[test]
    fn invalid_chars_become_tilde() {
        let (name, dot) = host_to_dos("a+b.txt");
        assert_eq!(std::str::from_utf8(&name).unwrap(), "A~B.TXT");
        assert_eq!(dot, 3);
    }

    #[test]
    fn normalize_folds_dots() {
        let mut fs = DosFs::new();
        fs.cwd[2][..7].copy_from_slice(b"DIR\\SUB");
        let (drive, path) = fs.normalize("..\\OTHER\\.\\FILE.TXT");
        assert_eq!(drive, 2);
        assert_eq!(path, "DIR\\OTHER\\FILE.TXT");
        let (_, abs) = fs.normalize("\\TOP");
        assert_eq!(abs, "TOP");
        let (d, p) = fs.normalize("A:FILE");
        assert_eq!(d, 0);
        assert_eq!(p, "FILE");
    }

    #[test]
    fn fcb_names() {
        assert_eq!(DosFs::fcb_file_name(b"FILE    TXT"), "FILE.TXT");
        assert_eq!(DosFs::fcb_file_name(b"FOO     \0\0\0"), "FOO");
        assert_eq!(DosFs::fcb_file_name(b"????????TXT"), "????????.TXT");
    }
}
