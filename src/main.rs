//! Offline driver for the instrumentation engine: validate probe
//! documents and rewrite captured classfiles without a live JVM.

use std::fs;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use classweave::classfile::ClassFile;
use classweave::desc;
use classweave::engine::InstrumentationEngine;
use classweave::probe::MatchState;
use classweave::rewrite::Transformed;
use classweave::validate::validate_probe_document;

#[derive(Parser)]
#[command(name = "classweave", about = "Probe-driven JVM bytecode rewriting", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a probe document and exit.
    Validate {
        /// Path to the probe XML document.
        probes: PathBuf,
    },
    /// Print the parsed descriptor model of a probe document as JSON.
    Describe {
        /// Path to the probe XML document.
        probes: PathBuf,
    },
    /// Rewrite captured .class files according to a probe document.
    Transform {
        /// Path to the probe XML document.
        #[arg(long)]
        probes: PathBuf,
        /// Directory rewritten classes and generated event types go to.
        #[arg(long, default_value = "out")]
        out: PathBuf,
        /// Captured .class files to run through the transformer.
        classes: Vec<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt::init();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Validate { probes } => {
            let document = fs::read_to_string(&probes)
                .with_context(|| format!("reading {}", probes.display()))?;
            validate_probe_document(&document)?;
            println!("{}: OK", probes.display());
            Ok(())
        }
        Command::Describe { probes } => {
            let document = fs::read_to_string(&probes)
                .with_context(|| format!("reading {}", probes.display()))?;
            let engine = InstrumentationEngine::new();
            engine.define_probes(&document)?;
            println!("{}", engine.retrieve_current_transforms_json());
            Ok(())
        }
        Command::Transform {
            probes,
            out,
            classes,
        } => transform(probes, out, classes),
    }
}

fn transform(probes: PathBuf, out: PathBuf, classes: Vec<PathBuf>) -> Result<()> {
    let document =
        fs::read_to_string(&probes).with_context(|| format!("reading {}", probes.display()))?;
    let engine = InstrumentationEngine::new();
    engine.define_probes(&document)?;
    fs::create_dir_all(&out).with_context(|| format!("creating {}", out.display()))?;

    let mut summary = Vec::new();
    for path in &classes {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let class = ClassFile::parse(&bytes)
            .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
        let internal = class.class_name().map_err(|e| anyhow::anyhow!("{e}"))?;
        let canonical = desc::canonical_name(internal);

        match engine.transformer().transform("offline", &canonical, &bytes) {
            Transformed::Unchanged => {
                summary.push(json!({
                    "class": canonical,
                    "rewritten": false,
                }));
            }
            Transformed::Rewritten {
                bytecode,
                event_classes,
            } => {
                let file_name = format!("{}.class", internal.replace('/', "."));
                fs::write(out.join(&file_name), &bytecode)
                    .with_context(|| format!("writing {file_name}"))?;
                let mut events = Vec::new();
                for event in &event_classes {
                    let event_file = format!("{}.class", event.class_name.replace('/', "."));
                    fs::write(out.join(&event_file), &event.bytes)
                        .with_context(|| format!("writing {event_file}"))?;
                    events.push(event.class_name.clone());
                }
                summary.push(json!({
                    "class": canonical,
                    "rewritten": true,
                    "event_classes": events,
                }));
            }
        }
    }

    let matched: Vec<_> = engine
        .retrieve_current_transforms()
        .iter()
        .map(|d| {
            json!({
                "id": d.id,
                "class": d.class_name,
                "method": format!("{}{}", d.method.name, d.method.descriptor),
                "state": match d.match_state.get() {
                    MatchState::Unresolved => "unresolved",
                    MatchState::MatchFound => "matched",
                    MatchState::MatchNotFound => "not-matched",
                },
            })
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "classes": summary,
            "probes": matched,
        }))?
    );
    Ok(())
}
