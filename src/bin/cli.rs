//! Flashcom command line interface.

use std::process;

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
    ArgMatches, SubCommand,
};
use console::style;
use log::{debug, trace, LevelFilter};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use simplelog::*;

use flashcom::{
    self as fc,
    image::{FirmwareImage, FlashParams},
    Operation,
};

fn main() {
    println!("[FC] flashcom v{}", crate_version!());

    ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        process::exit(0);
    })
    .expect("Failed to install my Ctrl-C handler!");

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Flashcom resets an ESP8266 into its boot ROM using the RTS and DTR \
            lines of the serial adapter, syncs with the ROM and runs one \
            operation. Operations on the flash (write, read, erase) are done \
            through a small flasher stub that is loaded into RAM and started \
            first; everything else talks to the ROM directly.\n\
            \n\
            The `image_info` and `make_image` operations work on files only \
            and do not need a device.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .setting(SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("DEVICE_TTY")
                .help("the serial device to use")
                .long_help(
                    "the serial device to use; when not set, the connected \
                     serial devices are listed for interactive selection.",
                )
                .short("-t")
                .long("--tty")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("baud rate used to talk to the boot ROM")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("115200")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FLASH_BAUD_RATE")
                .help("baud rate the flasher stub switches to, 0 to keep the ROM one")
                .long("--flash-baud")
                .takes_value(true)
                .default_value("921600")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("DATA_BITS")
                .help("number of bits per character")
                .short("-d")
                .long("--data-bits")
                .takes_value(true)
                .possible_values(&["5", "6", "7", "8"])
                .default_value("8")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("STOP_BITS")
                .help("number of stop bits per byte")
                .short("-s")
                .long("--stop-bits")
                .takes_value(true)
                .possible_values(&["1", "2"])
                .default_value("1")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PARITY")
                .help("parity checking protocol")
                .short("-p")
                .long("--parity")
                .takes_value(true)
                .possible_values(&["none", "odd", "even"])
                .default_value("none")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FLOW_CONTROL")
                .help("flow control mode")
                .short("-f")
                .long("--flow-control")
                .takes_value(true)
                .possible_values(&["none", "soft", "hard"])
                .default_value("none")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("STUB")
                .help("flasher stub descriptor (JSON) to use instead of the built-in one")
                .long("--stub")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("INVERT_LINES")
                .help("the adapter drives RTS/DTR low when asserted")
                .long("--invert-lines"),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .subcommand(
            SubCommand::with_name("load_ram")
                .about("Download an image to RAM and execute it")
                .arg(Arg::with_name("FILENAME").required(true)),
        )
        .subcommand(
            SubCommand::with_name("read_mem")
                .about("Read an arbitrary memory location")
                .arg(Arg::with_name("ADDRESS").required(true)),
        )
        .subcommand(
            SubCommand::with_name("write_mem")
                .about("Read-modify-write to an arbitrary memory location")
                .arg(Arg::with_name("ADDRESS").required(true))
                .arg(Arg::with_name("VALUE").required(true))
                .arg(Arg::with_name("MASK").required(true)),
        )
        .subcommand(
            SubCommand::with_name("dump_mem")
                .about("Dump arbitrary memory to disk")
                .arg(Arg::with_name("ADDRESS").required(true))
                .arg(Arg::with_name("SIZE").required(true))
                .arg(Arg::with_name("FILENAME").required(true)),
        )
        .subcommand(
            SubCommand::with_name("write_flash")
                .about("Write binary blobs to flash")
                .arg(
                    Arg::with_name("ADDR_FILENAME")
                        .help("address and file pairs")
                        .required(true)
                        .multiple(true),
                )
                .arg(
                    Arg::with_name("FLASH_MODE")
                        .help("SPI flash mode")
                        .long("--flash_mode")
                        .takes_value(true)
                        .possible_values(&["qio", "qout", "dio", "dout"])
                        .default_value("qio"),
                )
                .arg(
                    Arg::with_name("FLASH_SIZE")
                        .help("SPI flash size in megabits")
                        .long("--flash_size")
                        .takes_value(true)
                        .possible_values(&[
                            "4m", "2m", "8m", "16m", "32m", "16m-c1", "32m-c1", "32m-c2",
                        ])
                        .default_value("4m"),
                )
                .arg(
                    Arg::with_name("FLASH_FREQ")
                        .help("SPI flash clock frequency")
                        .long("--flash_freq")
                        .takes_value(true)
                        .possible_values(&["40m", "26m", "20m", "80m"])
                        .default_value("40m"),
                )
                .arg(
                    Arg::with_name("NO_STUB")
                        .help("write through the boot ROM only (slow)")
                        .long("--no-stub"),
                ),
        )
        .subcommand(
            SubCommand::with_name("read_flash")
                .about("Read a flash region to a file")
                .arg(Arg::with_name("ADDRESS").required(true))
                .arg(Arg::with_name("SIZE").required(true))
                .arg(Arg::with_name("FILENAME").required(true)),
        )
        .subcommand(SubCommand::with_name("erase_flash").about("Erase the whole flash chip"))
        .subcommand(SubCommand::with_name("run").about("Run the application code in flash"))
        .subcommand(
            SubCommand::with_name("image_info")
                .about("Dump the headers of an application image")
                .arg(Arg::with_name("FILENAME").required(true)),
        )
        .subcommand(
            SubCommand::with_name("make_image")
                .about("Create an application image from binary files")
                .arg(Arg::with_name("OUTPUT").required(true))
                .arg(
                    Arg::with_name("SEGFILE")
                        .help("segment input file")
                        .long("--segfile")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1),
                )
                .arg(
                    Arg::with_name("SEGADDR")
                        .help("segment base address")
                        .long("--segaddr")
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1),
                )
                .arg(
                    Arg::with_name("ENTRYPOINT")
                        .help("address of the entry point")
                        .long("--entrypoint")
                        .takes_value(true)
                        .default_value("0"),
                ),
        )
        .subcommand(SubCommand::with_name("read_mac").about("Read the MAC address from OTP ROM"))
        .subcommand(
            SubCommand::with_name("flash_id").about("Read the SPI flash manufacturer and device id"),
        )
        .subcommand(
            SubCommand::with_name("run_stub")
                .about("Run a stub and print what it sends back")
                .arg(Arg::with_name("STUB_JSON").required(true))
                .arg(Arg::with_name("PARAMS").multiple(true)),
        )
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'flashcom -v -v -v' or 'flashcom -vvv' vs 'flashcom -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .unwrap();

    trace!("{:#?}", matches);

    // Offline operations ======================================================

    match matches.subcommand() {
        ("image_info", Some(sub)) => process::exit(image_info(sub)),
        ("make_image", Some(sub)) => process::exit(make_image(sub)),
        _ => {}
    }

    // Arguments with default values ===========================================

    // It's safe to call unwrap on all command line arguments with default
    // values, because the value with either be what the user input at runtime
    // or the default value

    let baud_rate = value_t!(matches.value_of("BAUD_RATE"), u32)
        .unwrap_or_else(|_| bad_value("baud-rate", matches.value_of("BAUD_RATE").unwrap()));
    let flash_baud_rate = value_t!(matches.value_of("FLASH_BAUD_RATE"), u32)
        .unwrap_or_else(|_| bad_value("flash-baud", matches.value_of("FLASH_BAUD_RATE").unwrap()));

    let data_bits = match matches.value_of("DATA_BITS").unwrap() {
        "5" => DataBits::Five,
        "6" => DataBits::Six,
        "7" => DataBits::Seven,
        "8" => DataBits::Eight,
        _ => unreachable!(),
    };

    let stop_bits = match matches.value_of("STOP_BITS").unwrap() {
        "1" => StopBits::One,
        "2" => StopBits::Two,
        _ => unreachable!(),
    };

    let parity = match matches.value_of("PARITY").unwrap() {
        "none" => Parity::None,
        "even" => Parity::Even,
        "odd" => Parity::Odd,
        _ => unreachable!(),
    };

    let flow_control = match matches.value_of("FLOW_CONTROL").unwrap() {
        "none" => FlowControl::None,
        "soft" => FlowControl::Software,
        "hard" => FlowControl::Hardware,
        _ => unreachable!(),
    };

    // END - Arguments with default values =====================================

    let mut settings = fc::SettingsBuilder::default()
        .baud_rate(baud_rate)
        .flash_baud_rate(flash_baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(flow_control)
        .invert_control_lines(matches.is_present("INVERT_LINES"))
        .operation(operation(&matches))
        .finalize();

    // START - Arguments with NO default values ================================

    if matches.is_present("DEVICE_TTY") {
        settings.path = Some(matches.value_of("DEVICE_TTY").unwrap().into());
    }

    if matches.is_present("STUB") {
        settings.stub = Some(matches.value_of("STUB").unwrap().into());
    }

    // END - Arguments =========================================================

    // Run the state machine ===================================================

    let mut fpsm = fc::factory(settings);
    let exit_code = fpsm.run();
    debug!("exit code: {}", exit_code);
    std::process::exit(exit_code.into());
}

/// Map the device-facing subcommand to its operation.
fn operation(matches: &ArgMatches) -> Operation {
    match matches.subcommand() {
        ("load_ram", Some(sub)) => Operation::LoadRam {
            image: sub.value_of("FILENAME").unwrap().into(),
        },
        ("read_mem", Some(sub)) => Operation::ReadMem {
            address: number(sub, "ADDRESS"),
        },
        ("write_mem", Some(sub)) => Operation::WriteMem {
            address: number(sub, "ADDRESS"),
            value: number(sub, "VALUE"),
            mask: number(sub, "MASK"),
        },
        ("dump_mem", Some(sub)) => Operation::DumpMem {
            address: number(sub, "ADDRESS"),
            size: number(sub, "SIZE"),
            output: sub.value_of("FILENAME").unwrap().into(),
        },
        ("write_flash", Some(sub)) => {
            let pairs: Vec<&str> = sub.values_of("ADDR_FILENAME").unwrap().collect();
            if pairs.len() % 2 != 0 {
                println!(
                    "{}: `{}` takes address and file pairs",
                    style("error").red(),
                    style("write_flash").cyan()
                );
                process::exit(-1);
            }
            let regions = pairs
                .chunks(2)
                .map(|pair| {
                    let address =
                        parse_number(pair[0]).unwrap_or_else(|| bad_value("address", pair[0]));
                    (address, pair[1].to_string())
                })
                .collect();
            let flash_params = FlashParams {
                mode: sub.value_of("FLASH_MODE").unwrap().parse().unwrap(),
                size: sub.value_of("FLASH_SIZE").unwrap().parse().unwrap(),
                freq: sub.value_of("FLASH_FREQ").unwrap().parse().unwrap(),
            };
            Operation::WriteFlash {
                regions,
                flash_params,
                use_stub: !sub.is_present("NO_STUB"),
            }
        }
        ("read_flash", Some(sub)) => Operation::ReadFlash {
            address: number(sub, "ADDRESS"),
            size: number(sub, "SIZE"),
            output: sub.value_of("FILENAME").unwrap().into(),
        },
        ("erase_flash", _) => Operation::EraseFlash,
        ("run", _) => Operation::Run,
        ("read_mac", _) => Operation::ReadMac,
        ("flash_id", _) => Operation::FlashId,
        ("run_stub", Some(sub)) => Operation::RunStub {
            stub: sub.value_of("STUB_JSON").unwrap().into(),
            params: sub
                .values_of("PARAMS")
                .map(|values| {
                    values
                        .map(|v| parse_number(v).unwrap_or_else(|| bad_value("param", v)))
                        .collect()
                })
                .unwrap_or_default(),
        },
        _ => unreachable!(),
    }
}

fn image_info(matches: &ArgMatches) -> i32 {
    let filename = matches.value_of("FILENAME").unwrap();
    match FirmwareImage::from_file(filename) {
        Ok(image) => {
            println!("[FC] {}", style(filename).green());
            println!("{}", image);
            0
        }
        Err(err) => {
            println!("{}", style(format!("[FC] 💥 {}", err)).red());
            1
        }
    }
}

fn make_image(matches: &ArgMatches) -> i32 {
    let files: Vec<&str> = matches.values_of("SEGFILE").map_or(vec![], |v| v.collect());
    let addrs: Vec<&str> = matches.values_of("SEGADDR").map_or(vec![], |v| v.collect());
    if files.len() != addrs.len() {
        println!(
            "{}: number of `--segfile` and `--segaddr` arguments must match",
            style("error").red()
        );
        return -1;
    }

    let mut image = FirmwareImage::new(number(matches, "ENTRYPOINT"));
    for (file, addr) in files.iter().zip(addrs.iter()) {
        let address = parse_number(addr).unwrap_or_else(|| bad_value("segaddr", addr));
        let added = std::fs::read(file)
            .map_err(fc::Error::from)
            .and_then(|data| image.add_segment(address, &data));
        if let Err(err) = added {
            println!("{}", style(format!("[FC] 💥 {}: {}", file, err)).red());
            return 1;
        }
    }

    let output = matches.value_of("OUTPUT").unwrap();
    match image.save(output) {
        Ok(()) => {
            println!("[FC] 💾 Image saved to {}", style(output).green());
            0
        }
        Err(err) => {
            println!("{}", style(format!("[FC] 💥 {}", err)).red());
            1
        }
    }
}

/// Accepts decimal and `0x` prefixed hexadecimal numbers.
fn parse_number(value: &str) -> Option<u32> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn number(matches: &ArgMatches, name: &str) -> u32 {
    let value = matches.value_of(name).unwrap();
    parse_number(value).unwrap_or_else(|| bad_value(&name.to_lowercase(), value))
}

fn bad_value(name: &str, value: &str) -> ! {
    println!(
        "{}: `{}` needs to be a numeric value",
        style("error").red(),
        style(name).cyan()
    );
    println!(
        "   {} `{}` is not a valid value",
        style("-->").cyan(),
        style(value).on_red()
    );
    process::exit(-1);
}
