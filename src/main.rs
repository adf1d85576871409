// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

#[cfg(test)]
mod test_util;

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use block::config::TopologyConfig;
use block::control::{self, Command as BlockCommand, CommandError};
use block::BlockGraph;
use blockgraph::cli_print_error_chain;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::LevelFilter;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
enum Error {
    #[error("{0} of {1} commands failed")]
    CommandsFailed(usize, usize),
    #[error("Failed to parse command {0}")]
    ParseCommand(usize, #[source] serde_json::Error),
}

/// One line of output per command, or per event emitted while it ran.
#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
enum Reply {
    Return(Value),
    Error(CommandError),
    Event(Value),
}

fn create_app() -> Command {
    Command::new("blockgraph")
        .version(clap::crate_version!())
        .author(clap::crate_authors!())
        .about("Run snapshot and dirty bitmap commands against a block node graph.")
        .args(get_cli_options_sorted())
}

fn get_cli_options_sorted() -> Box<[Arg]> {
    [
        Arg::new("commands")
            .long("commands")
            .help("File holding a sequence of JSON commands, read from stdin if not given")
            .num_args(1)
            .value_parser(clap::value_parser!(PathBuf)),
        Arg::new("events")
            .long("events")
            .help("Report the events the graph emits after each command")
            .action(ArgAction::SetTrue),
        Arg::new("topology")
            .long("topology")
            .help("JSON description of the nodes and devices to open")
            .num_args(1)
            .required(true)
            .value_parser(clap::value_parser!(PathBuf)),
        Arg::new("v")
            .short('v')
            .action(ArgAction::Count)
            .help("Sets the level of debugging output"),
    ]
    .to_vec()
    .into_boxed_slice()
}

fn log_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn load_topology(path: &Path) -> anyhow::Result<BlockGraph> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read topology {}", path.display()))?;
    let config: TopologyConfig = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse topology {}", path.display()))?;
    config.build().context("Failed to build the node graph")
}

fn write_reply(out: &mut dyn Write, reply: &Reply) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *out, reply).context("Failed to serialise reply")?;
    writeln!(out).context("Failed to write reply")
}

/// Executes every command of `input` in order, stopping at the first one
/// that can't be parsed. Returns how many commands failed.
fn run_commands(
    graph: &BlockGraph,
    input: &str,
    events: bool,
    out: &mut dyn Write,
) -> anyhow::Result<(usize, usize)> {
    let receiver = events.then(|| graph.events().subscribe());
    let mut failed = 0;
    let mut total = 0;

    for (i, command) in serde_json::Deserializer::from_str(input)
        .into_iter::<BlockCommand>()
        .enumerate()
    {
        let command = command.map_err(|e| Error::ParseCommand(i, e))?;
        total += 1;

        let reply = match control::execute(graph, command) {
            Ok(value) => Reply::Return(value),
            Err(e) => {
                failed += 1;
                Reply::Error(e)
            }
        };
        write_reply(out, &reply)?;

        if let Some(receiver) = &receiver {
            for event in receiver.try_iter() {
                let event: Value = serde_json::from_str(&event).context("Malformed event")?;
                write_reply(out, &Reply::Event(event))?;
            }
        }
    }

    Ok((failed, total))
}

fn start(cmd_arguments: &ArgMatches) -> anyhow::Result<()> {
    let topology = cmd_arguments
        .get_one::<PathBuf>("topology")
        .context("Missing --topology")?;
    let graph = load_topology(topology)?;

    let input = match cmd_arguments.get_one::<PathBuf>("commands") {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Failed to read commands from {}", path.display()))?,
        None => {
            let mut input = String::new();
            io::stdin()
                .read_to_string(&mut input)
                .context("Failed to read commands from stdin")?;
            input
        }
    };

    let events = cmd_arguments.get_flag("events");
    let ret = run_commands(&graph, &input, events, &mut io::stdout().lock());
    graph.close_all();

    let (failed, total) = ret?;
    info!("Ran {total} commands, {failed} failed");
    if failed > 0 {
        return Err(Error::CommandsFailed(failed, total).into());
    }
    Ok(())
}

fn main() {
    let cmd_arguments = create_app().get_matches();

    env_logger::Builder::from_default_env()
        .filter_level(log_level(cmd_arguments.get_count("v")))
        .format_timestamp_millis()
        .init();

    if let Err(e) = start(&cmd_arguments) {
        cli_print_error_chain(e.as_ref(), "blockgraph");
        process::exit(1);
    }
}
