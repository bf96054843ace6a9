use std::path;
use std::process;

use bytesize::ByteSize;
use clap::ArgEnum;
use env_logger;
use log;

use ext_sort_i64::{DecodePolicy, ExternalSorter, ExternalSorterBuilder, OutputMode};

fn main() {
    let arg_parser = build_arg_parser();

    let log_level: LogLevel = arg_parser.value_of_t_or_exit("log_level");
    init_logger(log_level);

    let inputs: Vec<&str> = arg_parser.values_of("input").expect("value is required").collect();
    let output = arg_parser.value_of("output").expect("value is required");
    let chunk_capacity: usize = arg_parser.value_of_t_or_exit("chunk_capacity");
    let max_open_chunks: usize = arg_parser.value_of_t_or_exit("max_open_chunks");
    let tmp_dir: Option<&str> = arg_parser.value_of("tmp_dir");
    let threads: Option<usize> = arg_parser
        .is_present("threads")
        .then(|| arg_parser.value_of_t_or_exit("threads"));
    let buf_size: Option<ByteSize> = arg_parser
        .value_of("buf_size")
        .map(|v| v.parse::<ByteSize>().expect("value is pre-validated"));

    let mut sorter_builder: ExternalSorterBuilder = ExternalSorterBuilder::new();
    sorter_builder = sorter_builder
        .with_chunk_capacity(chunk_capacity)
        .with_max_open_chunks(max_open_chunks)
        .with_parallel_sources(!arg_parser.is_present("sequential"));

    if arg_parser.is_present("strict") {
        sorter_builder = sorter_builder.with_decode_policy(DecodePolicy::Fail);
    }

    if arg_parser.is_present("no_clobber") {
        sorter_builder = sorter_builder.with_output_mode(OutputMode::FailIfExists);
    }

    if let Some(threads) = threads {
        sorter_builder = sorter_builder.with_threads_number(threads);
    }

    if let Some(tmp_dir) = tmp_dir {
        sorter_builder = sorter_builder.with_tmp_dir(path::Path::new(tmp_dir));
    }

    if let Some(buf_size) = buf_size {
        sorter_builder = sorter_builder.with_rw_buf_size(buf_size.as_u64() as usize);
    }

    let sorter: ExternalSorter = match sorter_builder.build() {
        Ok(sorter) => sorter,
        Err(err) => {
            log::error!("sorter initialization error: {}", err);
            process::exit(1);
        }
    };

    match sorter.sort(&inputs, path::Path::new(output)) {
        Ok(summary) => log::info!(
            "{} values from {} sources sorted into {} ({} malformed records skipped)",
            summary.values,
            summary.sources,
            output,
            summary.skipped
        ),
        Err(err) => {
            log::error!("data sorting error: {}", err);
            process::exit(1);
        }
    }
}

#[derive(Copy, Clone, clap::ArgEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn possible_values() -> impl Iterator<Item = clap::PossibleValue<'static>> {
        Self::value_variants().iter().filter_map(|v| v.to_possible_value())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        <LogLevel as clap::ArgEnum>::from_str(s, false)
    }
}

fn build_arg_parser() -> clap::ArgMatches {
    clap::App::new("ext-sort-i64")
        .about("external sorter for files of 64-bit signed integers, one per line")
        .arg(
            clap::Arg::new("input")
                .short('i')
                .long("input")
                .help("file to be sorted, may be repeated")
                .required(true)
                .takes_value(true)
                .multiple_occurrences(true),
        )
        .arg(
            clap::Arg::new("output")
                .short('o')
                .long("output")
                .help("result file")
                .required(true)
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("chunk_capacity")
                .short('c')
                .long("chunk-capacity")
                .help("maximum number of values sorted in memory at once per input")
                .takes_value(true)
                .default_value("500000")
                .validator(|v| match v.parse::<usize>() {
                    Ok(0) => Err(String::from("chunk capacity must be positive")),
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("chunk capacity format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("strict")
                .short('s')
                .long("strict")
                .help("abort on malformed records instead of skipping them"),
        )
        .arg(
            clap::Arg::new("no_clobber")
                .short('n')
                .long("no-clobber")
                .help("fail if the result file already exists"),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("loglevel")
                .help("logging level")
                .takes_value(true)
                .default_value("info")
                .possible_values(LogLevel::possible_values()),
        )
        .arg(
            clap::Arg::new("threads")
                .short('t')
                .long("threads")
                .help("number of threads to use for parallel chunking")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("sequential")
                .long("sequential")
                .help("chunk input files one after another"),
        )
        .arg(
            clap::Arg::new("tmp_dir")
                .short('d')
                .long("tmp-dir")
                .help("directory to be used to store temporary data")
                .takes_value(true),
        )
        .arg(
            clap::Arg::new("buf_size")
                .short('b')
                .long("buf-size")
                .help("file read/write buffer size")
                .takes_value(true)
                .validator(|v| match v.parse::<ByteSize>() {
                    Ok(size) if size.as_u64() == 0 => Err(String::from("buffer size must be positive")),
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("buffer size format incorrect: {}", err)),
                }),
        )
        .arg(
            clap::Arg::new("max_open_chunks")
                .short('m')
                .long("max-open-chunks")
                .help("maximum number of chunk files merged at once")
                .takes_value(true)
                .default_value("128")
                .validator(|v| match v.parse::<usize>() {
                    Ok(n) if n < 2 => Err(String::from("at least 2 chunks must be merged at once")),
                    Ok(_) => Ok(()),
                    Err(err) => Err(format!("max open chunks format incorrect: {}", err)),
                }),
        )
        .get_matches()
}

fn init_logger(log_level: LogLevel) {
    env_logger::Builder::new()
        .filter_level(match log_level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        })
        .format_timestamp_millis()
        .init();
}
