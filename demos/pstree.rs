//! Prints the Linux process tree of a raw memory dump using a JSON profile.
use clap::{crate_authors, crate_version, Arg, ArgAction, ArgMatches, Command};
use log::Level;

use memflow::prelude::v1::*;

use memflow_overlay::linux::{self, PsTree, SortOrder};
use memflow_overlay::profile::ProfileBuilder;
use memflow_overlay::space::SparseSpace;

fn main() -> Result<()> {
    let matches = parse_args();
    init_logger(&matches);

    let profile_src = std::fs::read_to_string(arg(&matches, "profile")?).map_err(|err| {
        Error(ErrorOrigin::Other, ErrorKind::UnableToReadFile).log_error(err)
    })?;
    let dump = std::fs::read(arg(&matches, "dump")?).map_err(|err| {
        Error(ErrorOrigin::Other, ErrorKind::UnableToReadFile).log_error(err)
    })?;

    let base = matches
        .get_one::<String>("base")
        .map(|base| umem::from_str_radix(base.trim_start_matches("0x"), 16))
        .transpose()
        .map_err(|err| Error(ErrorOrigin::ArgsValidator, ErrorKind::ArgValidation).log_error(err))?
        .unwrap_or(0);

    let sort_order = matches
        .get_one::<usize>("sort")
        .copied()
        .map(SortOrder::from_index)
        .unwrap_or(Some(SortOrder::Pid))
        .ok_or_else(|| {
            Error(ErrorOrigin::ArgsValidator, ErrorKind::ArgValidation)
                .log_error("sort column must be between 0 and 4")
        })?;

    let space = SparseSpace::new().with_range(Address::from(base), dump)?;
    let profile = linux::initialize(ProfileBuilder::from_json(&profile_src)?).build()?;

    let mut pstree = PsTree::new().sort_order(sort_order);
    if let Some(search) = matches.get_one::<String>("search") {
        pstree = pstree.search(search);
    }

    println!("{:>6} {:>6} {:>6} Name", "Pid", "Ppid", "Uid");
    for row in pstree.rows(&profile, &space)? {
        println!("{}", row);
    }

    Ok(())
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a String> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| Error(ErrorOrigin::Args, ErrorKind::RequiredArgNotFound).log_error(name))
}

fn parse_args() -> ArgMatches {
    Command::new("pstree example")
        .version(crate_version!())
        .author(crate_authors!())
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("profile")
                .long("profile")
                .short('p')
                .required(true)
                .help("JSON profile of the dumped kernel"),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .short('d')
                .required(true)
                .help("raw memory dump"),
        )
        .arg(
            Arg::new("base")
                .long("base")
                .short('b')
                .help("address the dump starts at, in hex"),
        )
        .arg(
            Arg::new("sort")
                .long("sort")
                .short('s')
                .value_parser(clap::value_parser!(usize))
                .help("column to sort by: 0 pid, 1 ppid, 2 uid, 3 depth, 4 name"),
        )
        .arg(Arg::new("search").long("search").help("only show rows containing this text"))
        .get_matches()
}

fn init_logger(matches: &ArgMatches) {
    let log_level = match matches.get_count("verbose") {
        0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    };
    simplelog::TermLogger::init(
        log_level.to_level_filter(),
        simplelog::Config::default(),
        simplelog::TerminalMode::Stdout,
        simplelog::ColorChoice::Auto,
    )
    .unwrap();
}
