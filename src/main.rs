use std::env;
use std::path::PathBuf;

use anyhow::{Context as _, Result, bail};

use ne16::module::CONSTANT_SELECTOR;
use ne16::ne::EntryFlags;
use ne16::{Config, Machine, Thread};

struct Args {
    config: Option<PathBuf>,
    module: PathBuf,
}

fn main() {
    env_logger::init();

    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let mut machine = Machine::new(config);
    let mut thread = Thread::default();
    let handle = machine
        .load_module(&mut thread, &args.module)
        .with_context(|| format!("loading {}", args.module.display()))?;
    let module = machine
        .modules
        .get(handle)
        .context("module vanished after loading")?;

    println!("module: {}", module.name());
    println!("segments:");
    for (index, seg) in module.segments.iter().enumerate() {
        let flags: Vec<&str> = seg.flags.iter_names().map(|(name, _)| name).collect();
        println!(
            "  {} sel={:04x} len={:04x} flags={}",
            index + 1,
            seg.selector,
            machine.global_size(seg.selector),
            flags.join("|")
        );
    }

    println!("entries:");
    for (ordinal, entry) in module.entries.iter().flat_map(|b| b.ordinals()) {
        let Some(ptr) = machine.get_entry_point(handle, ordinal) else {
            continue;
        };
        let mut notes = Vec::new();
        if entry.flags.contains(EntryFlags::EXPORTED) {
            notes.push("exported");
        }
        if entry.flags.contains(EntryFlags::SHARED_DATA) {
            notes.push("shared");
        }
        if ptr.selector() == CONSTANT_SELECTOR {
            notes.push("constant");
        }
        let line = format!("  {ordinal} {ptr} {}", notes.join(" "));
        println!("{}", line.trim_end());
    }
    Ok(())
}

fn parse_args() -> Result<Args> {
    let mut args = env::args().skip(1);
    let mut config = None;
    let mut module = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(path) => config = Some(PathBuf::from(path)),
                None => bail!("--config needs a file argument"),
            },
            _ if module.is_none() => module = Some(PathBuf::from(arg)),
            _ => bail!("unexpected argument '{arg}'"),
        }
    }

    match module {
        Some(module) => Ok(Args { config, module }),
        None => bail!("expected path to an NE executable (usage: ne16 [--config <file.toml>] <module.exe>)"),
    }
}
