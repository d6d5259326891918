use anyhow::{Context, Result, bail, format_err};
use clap::{Arg, ArgAction, ArgMatches, Command};
use dialoguer::Confirm;
use encoding::all::encodings;
use encoding::{Encoding, EncodingRef};
use indoc::indoc;
use log::{Level, info};
use serde::Deserialize;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use etw_decode::{
    DefaultCallbacks, EnumeratorSettings, EtwEnumerator, EventInfo, EventRecord, JsonSuffixFlags,
    MapInfo, ResultCodeDomain, TimestampFlags, TimestampFormat, TimestampKind,
};

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::exit;

const DEFAULT_PREFIX: &str = "[%9]%8.%3::%4 [%1] ";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OutputFormat {
    Message,
    Prefix,
    Json,
}

#[derive(Debug, Deserialize)]
struct ParameterMessage {
    id: u32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultMessage {
    domain: ResultCodeDomain,
    code: u32,
    message: String,
}

/// Decoding information and records to format, as read from the input file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EventBundle {
    events: Vec<EventInfo>,
    maps: Vec<MapInfo>,
    parameter_messages: Vec<ParameterMessage>,
    result_messages: Vec<ResultMessage>,
    records: Vec<EventRecord>,
}

impl EventBundle {
    fn load(path: &Path) -> Result<Self> {
        let text = if path == Path::new("-") {
            let mut text = String::new();
            io::stdin()
                .read_to_string(&mut text)
                .context("failed to read event bundle from stdin")?;
            text
        } else {
            fs::read_to_string(path)
                .with_context(|| format!("failed to read event bundle `{}`", path.display()))?
        };

        serde_json::from_str(&text)
            .with_context(|| format!("invalid event bundle `{}`", path.display()))
    }

    /// Moves the decoding information into a registry, leaving only the records.
    fn take_callbacks(&mut self) -> DefaultCallbacks {
        let mut callbacks = DefaultCallbacks::new();
        for info in self.events.drain(..) {
            callbacks.register_event(info);
        }
        for map in self.maps.drain(..) {
            callbacks.register_map(map);
        }
        for param in self.parameter_messages.drain(..) {
            callbacks.register_parameter_message(param.id, param.message);
        }
        for result in self.result_messages.drain(..) {
            callbacks.register_result_message(result.domain, result.code, result.message);
        }
        callbacks
    }
}

/// Everything a worker needs to turn one record into a line.
#[derive(Debug, Clone)]
struct RecordFormatter {
    settings: EnumeratorSettings,
    output_format: OutputFormat,
    prefix: Option<String>,
    suffix: JsonSuffixFlags,
}

impl RecordFormatter {
    #[cfg(feature = "multithreading")]
    fn format_records(
        &self,
        callbacks: &DefaultCallbacks,
        records: &[EventRecord],
        num_threads: usize,
    ) -> Vec<Result<String>> {
        use rayon::prelude::*;

        let format = |records: &[EventRecord]| -> Vec<Result<String>> {
            records
                .par_iter()
                .map_init(
                    || EtwEnumerator::with_settings(callbacks, self.settings.clone()),
                    |enumerator, record| match enumerator {
                        Ok(enumerator) => self.format_record(enumerator, record),
                        Err(e) => Err(e.clone().into()),
                    },
                )
                .collect()
        };

        match rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
        {
            Ok(pool) => pool.install(|| format(records)),
            Err(e) => {
                eprintln!("failed to start worker threads ({}), using the global pool", e);
                format(records)
            }
        }
    }

    #[cfg(not(feature = "multithreading"))]
    fn format_records(
        &self,
        callbacks: &DefaultCallbacks,
        records: &[EventRecord],
        _num_threads: usize,
    ) -> Vec<Result<String>> {
        match EtwEnumerator::with_settings(callbacks, self.settings.clone()) {
            Ok(mut enumerator) => records
                .iter()
                .map(|record| self.format_record(&mut enumerator, record))
                .collect(),
            Err(e) => records.iter().map(|_| Err(e.clone().into())).collect(),
        }
    }

    fn format_record<'a>(
        &self,
        enumerator: &mut EtwEnumerator<'a>,
        record: &'a EventRecord,
    ) -> Result<String> {
        enumerator.start_event(record).with_context(|| {
            format!(
                "no decoding information for {} event {}",
                record.header.provider_id, record.header.descriptor.id
            )
        })?;

        let prefix = self.prefix.as_deref();
        let text = match self.output_format {
            OutputFormat::Message => enumerator.format_current_event(prefix, self.suffix)?,
            OutputFormat::Json => enumerator.format_current_event_as_json(prefix, self.suffix)?,
            OutputFormat::Prefix => {
                enumerator.format_current_event_prefix(prefix.unwrap_or(DEFAULT_PREFIX))?
            }
        };
        Ok(text.to_owned())
    }
}

struct EtwFormat {
    formatter: RecordFormatter,
    input: PathBuf,
    num_threads: usize,
    output: Box<dyn Write>,
    verbosity_level: Option<Level>,
    stop_after_error: bool,
}

impl EtwFormat {
    pub fn from_cli_matches(matches: &ArgMatches) -> Result<Self> {
        let input = PathBuf::from(
            matches
                .get_one::<String>("INPUT")
                .ok_or_else(|| format_err!("missing input"))?,
        );

        let output_format = match matches
            .get_one::<String>("output-format")
            .map(String::as_str)
        {
            Some("prefix") => OutputFormat::Prefix,
            Some("json") => OutputFormat::Json,
            _ => OutputFormat::Message,
        };

        let prefix = match (matches.get_one::<String>("prefix"), output_format) {
            (Some(prefix), _) => Some(prefix.clone()),
            (None, OutputFormat::Prefix) => Some(DEFAULT_PREFIX.to_owned()),
            (None, _) => None,
        };

        let suffix = parse_suffix_flags(
            matches
                .get_one::<String>("meta")
                .map(String::as_str)
                .unwrap_or("default"),
        )?;

        let num_threads = matches.get_one::<usize>("num-threads").copied().unwrap_or(0);
        let num_threads = match (cfg!(feature = "multithreading"), num_threads) {
            (true, number) => number,
            (false, 0 | 1) => 1,
            (false, _) => {
                eprintln!(
                    "turned on threads, but library was compiled without `multithreading` feature! using fallback sync iterator"
                );
                1
            }
        };

        let verbosity_level = match matches.get_count("verbose") {
            0 => None,
            1 => Some(Level::Info),
            2 => Some(Level::Debug),
            3 => Some(Level::Trace),
            _ => {
                eprintln!("using more than -vvv does not affect verbosity level");
                Some(Level::Trace)
            }
        };

        let mut time_flags = TimestampFlags::empty();
        for (arg, flag) in [
            ("local-time", TimestampFlags::LOCAL),
            ("low-precision", TimestampFlags::LOW_PRECISION),
            ("no-time-zone-suffix", TimestampFlags::NO_TIME_ZONE_SUFFIX),
            ("assume-filetime-utc", TimestampFlags::ASSUME_FILETIME_UTC),
        ] {
            if matches.get_flag(arg) {
                time_flags |= flag;
            }
        }
        let time_kind = if matches.get_flag("wpp-time") {
            TimestampKind::Wpp
        } else {
            TimestampKind::Internet
        };

        let ansi_codec_name = matches
            .get_one::<String>("ansi-codec")
            .map(String::as_str)
            .unwrap_or("windows-1252");
        let ansi_codec: EncodingRef = *encodings()
            .iter()
            .find(|c| c.name() == ansi_codec_name)
            .ok_or_else(|| format_err!("unknown ANSI codec `{}`", ansi_codec_name))?;

        let mut settings = EnumeratorSettings::new()
            .timestamp_format(TimestampFormat::new(time_kind, time_flags))
            .ansi_codec(ansi_codec);
        if let Some(bias) = matches.get_one::<i32>("bias") {
            settings = settings.timezone_bias_minutes(*bias);
        }
        if let Some(resolution) = matches.get_one::<u32>("timer-resolution") {
            settings = settings.timer_resolution(*resolution);
        }

        let output: Box<dyn Write> = if let Some(path) = matches.get_one::<String>("output-target")
        {
            let file = Self::create_output_file(path, !matches.get_flag("no-confirm-overwrite"))
                .with_context(|| format!("failed to create output file `{}`", path))?;
            Box::new(io::BufWriter::new(file))
        } else {
            Box::new(io::BufWriter::new(io::stdout()))
        };

        Ok(EtwFormat {
            formatter: RecordFormatter {
                settings,
                output_format,
                prefix,
                suffix,
            },
            input,
            num_threads,
            output,
            verbosity_level,
            stop_after_error: matches.get_flag("stop-after-one-error"),
        })
    }

    /// Main entry point for `EtwFormat`
    pub fn run(&mut self) -> Result<()> {
        self.try_to_initialize_logging();

        let mut bundle = EventBundle::load(&self.input)?;
        let callbacks = bundle.take_callbacks();
        info!(
            "loaded {} descriptors and {} records from `{}`",
            callbacks.event_count(),
            bundle.records.len(),
            self.input.display()
        );

        // Rejects bad settings before any worker starts.
        EtwEnumerator::with_settings(&callbacks, self.formatter.settings.clone())
            .context("invalid formatting settings")?;

        let lines = self
            .formatter
            .format_records(&callbacks, &bundle.records, self.num_threads);

        let mut failed = false;
        for (index, line) in lines.into_iter().enumerate() {
            match line {
                Ok(line) => writeln!(self.output, "{}", line)?,
                Err(e) => {
                    failed = true;
                    eprintln!("failed to format record {}: {:#}", index, e);
                    if self.stop_after_error {
                        break;
                    }
                }
            }
        }
        self.output.flush()?;

        if failed && self.stop_after_error {
            bail!("stopped after the first record that failed to format");
        }
        Ok(())
    }

    /// If `prompt` is passed, will display a confirmation prompt before overwriting files.
    fn create_output_file(path: impl AsRef<Path>, prompt: bool) -> Result<File> {
        let p = path.as_ref();

        if p.is_dir() {
            bail!(
                "There is a directory at {}, refusing to overwrite",
                p.display()
            );
        }

        if p.exists() {
            if prompt {
                match Confirm::new()
                    .with_prompt(format!(
                        "Are you sure you want to override output file at {}",
                        p.display()
                    ))
                    .default(false)
                    .interact()
                {
                    Ok(true) => Ok(File::create(p)?),
                    Ok(false) => bail!("Cancelled"),
                    Err(e) => bail!(
                        "Failed to write confirmation prompt to term caused by\n{}",
                        e
                    ),
                }
            } else {
                Ok(File::create(p)?)
            }
        } else {
            // Ok to assume p is not an existing directory
            match p.parent() {
                Some(parent) => {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        fs::create_dir_all(parent)?;
                    }
                    Ok(File::create(p)?)
                }
                None => bail!("Output file cannot be root."),
            }
        }
    }

    fn try_to_initialize_logging(&self) {
        if let Some(level) = self.verbosity_level {
            match TermLogger::init(
                level.to_level_filter(),
                Config::default(),
                TerminalMode::Stderr,
                ColorChoice::Auto,
            ) {
                Ok(_) => {}
                Err(e) => eprintln!("Failed to initialize logging: {:?}", e),
            };
        }
    }
}

/// `default`, `all`, `none`, or a hexadecimal mask such as `0x47`.
fn parse_suffix_flags(value: &str) -> Result<JsonSuffixFlags> {
    match value {
        "default" => Ok(JsonSuffixFlags::DEFAULT),
        "all" => Ok(JsonSuffixFlags::all()),
        "none" => Ok(JsonSuffixFlags::empty()),
        _ => {
            let digits = value.trim_start_matches("0x").trim_start_matches("0X");
            let bits = u32::from_str_radix(digits, 16)
                .with_context(|| format!("invalid meta flags `{}`", value))?;
            JsonSuffixFlags::from_bits(bits)
                .ok_or_else(|| format_err!("unknown meta flags in `{}`", value))
        }
    }
}

fn command() -> Command {
    Command::new("etw_format")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Formats decoded ETW events from an event bundle")
        .long_about(indoc!(r#"
            Formats decoded ETW events from an event bundle.

            The bundle is a JSON document with the decoding information and the raw records:

                {
                  "events": [ ...EventInfo... ],
                  "maps": [ ...MapInfo... ],
                  "parameter_messages": [ { "id": 5, "message": "..." } ],
                  "result_messages": [ { "domain": "win32", "code": 2, "message": "..." } ],
                  "records": [ ...EventRecord, payload as hex... ]
                }

            Each record is printed on its own line. Records that fail to format are reported
            on stderr.
        "#))
        .arg(
            Arg::new("INPUT")
                .required(true)
                .help("Path to the event bundle, or `-` for stdin."),
        )
        .arg(
            Arg::new("num-threads")
                .short('t')
                .long("threads")
                .default_value("0")
                .value_parser(clap::value_parser!(usize))
                .help("Sets the number of worker threads, defaults to number of CPU cores."),
        )
        .arg(
            Arg::new("output-format")
                .short('o')
                .long("format")
                .value_parser(["message", "prefix", "json"])
                .default_value("message")
                .help("Sets the output format")
                .long_help(indoc!(r#"
                    Sets the output format:
                        "message" - the event message, or JSON if the event has none.
                        "prefix"  - only the expanded prefix.
                        "json"    - the event payload as JSON.
                "#)),
        )
        .arg(
            Arg::new("prefix")
                .short('p')
                .long("prefix")
                .value_name("TEMPLATE")
                .allow_hyphen_values(true)
                .help("Template printed before each event, e.g. `[%9]%8.%3::%4 [%1] `."),
        )
        .arg(
            Arg::new("meta")
                .long("meta")
                .value_name("FLAGS")
                .default_value("default")
                .help("Fields of the JSON \"meta\" object: default, all, none, or a hex mask."),
        )
        .arg(
            Arg::new("bias")
                .long("bias")
                .value_name("MINUTES")
                .allow_negative_numbers(true)
                .value_parser(clap::value_parser!(i32).range(-1440..=1440))
                .help("Minutes to add to UTC for local times, defaults to the system time zone."),
        )
        .arg(
            Arg::new("timer-resolution")
                .long("timer-resolution")
                .value_name("TICKS")
                .value_parser(clap::value_parser!(u32))
                .help("Timer resolution in 100ns units, used for kernel and user times."),
        )
        .arg(
            Arg::new("local-time")
                .long("local-time")
                .action(ArgAction::SetTrue)
                .help("Convert UTC timestamps to local time."),
        )
        .arg(
            Arg::new("low-precision")
                .long("low-precision")
                .action(ArgAction::SetTrue)
                .help("Print milliseconds instead of 100ns ticks."),
        )
        .arg(
            Arg::new("no-time-zone-suffix")
                .long("no-time-zone-suffix")
                .action(ArgAction::SetTrue)
                .help("Omit the `Z` or offset suffix from timestamps."),
        )
        .arg(
            Arg::new("assume-filetime-utc")
                .long("assume-filetime-utc")
                .action(ArgAction::SetTrue)
                .help("Treat FILETIME values without a UTC hint as UTC."),
        )
        .arg(
            Arg::new("wpp-time")
                .long("wpp-time")
                .action(ArgAction::SetTrue)
                .help("Use the `MM/DD/YYYY-hh:mm:ss` timestamp layout."),
        )
        .arg(
            Arg::new("ansi-codec")
                .long("ansi-codec")
                .value_parser(clap::builder::PossibleValuesParser::new(
                    encodings()
                        .iter()
                        .map(|e| e.name())
                        .collect::<Vec<&'static str>>(),
                ))
                .default_value(encoding::all::WINDOWS_1252.name())
                .help("Codec of ANSI encoded strings."),
        )
        .arg(
            Arg::new("output-target")
                .long("output")
                .short('f')
                .value_name("PATH")
                .help(indoc!("
                    Writes output to the file specified instead of stdout, errors will still be printed to stderr.
                    Will ask for confirmation before overwriting files, to allow overwriting, pass `--no-confirm-overwrite`
                    Will create parent directories if needed.
                ")),
        )
        .arg(
            Arg::new("no-confirm-overwrite")
                .long("no-confirm-overwrite")
                .action(ArgAction::SetTrue)
                .help("When set, will not ask for confirmation before overwriting files, useful for automation"),
        )
        .arg(
            Arg::new("stop-after-one-error")
                .long("stop-after-one-error")
                .action(ArgAction::SetTrue)
                .help("When set, will exit with an error after the first record that fails to format."),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("-v - info, -vv - debug, -vvv - trace."),
        )
}

fn main() {
    let matches = command().get_matches();

    let result = EtwFormat::from_cli_matches(&matches).and_then(|mut app| app.run());
    if let Err(e) = result {
        eprintln!("{:?}", e);
        exit(1);
    }
}
