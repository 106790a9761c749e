use std::ffi::OsString;
use std::io::{self, BufRead, Write};
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use kpdb::{trim, KpConfig, KpDb, LockMode};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "dkp [-d] [-s] [-r] [-w] [-x] [-t] file [key [field=value]]";

#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    debug: bool,
    read: bool,
    write: bool,
    delete: bool,
    sort: bool,
    trim: bool,
    file: Option<PathBuf>,
    key: Option<Vec<u8>>,
    assign: Option<Vec<u8>>,
}

fn parse_args(args: impl IntoIterator<Item = OsString>) -> Options {
    let mut opts = Options::default();
    for arg in args {
        let bytes = arg.into_vec();
        if bytes.first() != Some(&b'-') {
            if opts.file.is_none() {
                opts.file = Some(PathBuf::from(OsString::from_vec(bytes)));
            } else if opts.key.is_none() {
                opts.key = Some(bytes);
            } else if opts.assign.is_none() {
                opts.assign = Some(bytes);
            }
            continue;
        }
        match bytes.get(1) {
            Some(b'd') => opts.debug = true,
            Some(b'r') => opts.read = true,
            Some(b'w') => {
                opts.read = true;
                opts.write = true;
            }
            Some(b'x') => opts.delete = true,
            Some(b's') => opts.sort = true,
            Some(b't') => opts.trim = true,
            _ => tracing::debug!(flag = %String::from_utf8_lossy(&bytes), "ignoring unknown flag"),
        }
    }
    opts
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let opts = parse_args(std::env::args_os().skip(1));
    init_tracing(opts.debug);

    let Some(path) = opts.file.clone() else {
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    };

    let stdin = io::stdin();
    let stdout = io::stdout();
    match run(&opts, &path, stdin.lock(), &mut stdout.lock()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dkp: {}: {}", path.display(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(opts: &Options, path: &Path, input: impl BufRead, out: &mut impl Write) -> kpdb::Result<()> {
    if opts.trim {
        let stats = trim(path)?;
        writeln!(
            out,
            "trimmed {}: kept {} dropped {} ({} -> {} bytes)",
            path.display(),
            stats.kept,
            stats.dropped,
            stats.bytes_before,
            stats.bytes_after
        )?;
    }

    let mut db = KpDb::open_with_config(KpConfig::new(path).create(opts.write))?;
    if opts.sort {
        db.force_resort()?;
    }

    match &opts.key {
        Some(key) => execute(&mut db, opts, key, opts.assign.as_deref(), false, out)?,
        None if opts.read || opts.write || opts.delete => {
            for line in input.split(b'\n') {
                let line = line?;
                let mut tokens = line
                    .split(|&b| b == b' ' || b == b'\t')
                    .filter(|token| !token.is_empty());
                let Some(key) = tokens.next() else {
                    continue;
                };
                if let Err(e) = execute(&mut db, opts, key, tokens.next(), true, out) {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    tracing::warn!(key = %String::from_utf8_lossy(key), error = %e, "command failed");
                }
            }
        }
        None => {}
    }

    db.close()
}

fn execute(
    db: &mut KpDb,
    opts: &Options,
    key: &[u8],
    assign: Option<&[u8]>,
    batch: bool,
    out: &mut impl Write,
) -> kpdb::Result<()> {
    if opts.delete {
        if !db.delete(key)? {
            tracing::debug!(key = %String::from_utf8_lossy(key), "nothing to delete");
        }
        return Ok(());
    }

    let pair = assign.and_then(|tok| {
        let eq = tok.iter().position(|&b| b == b'=')?;
        Some((&tok[..eq], &tok[eq + 1..]))
    });
    if let (true, Some((name, value))) = (opts.write, pair) {
        return db.write(key, Some(name), value, LockMode::Transient);
    }

    if opts.read {
        match db.read_record(key, false)? {
            Some(record) => {
                let bytes = record.as_bytes();
                write!(out, "key {} data ({}) ", String::from_utf8_lossy(key), bytes.len())?;
                out.write_all(bytes)?;
            }
            None if batch => writeln!(out, "key {} data <not-found>", String::from_utf8_lossy(key))?,
            None => writeln!(out, "<not found>")?,
        }
    }
    Ok(())
}
