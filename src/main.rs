#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;
#[cfg(not(target_env = "musl"))]
use mimalloc as _;

use std::io::prelude::*;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use env_logger::Builder;
use log::{Level, LevelFilter};
use owo_colors::OwoColorize;
use vulcan_core::util::format_size;
use vulcan_eficomp::prelude::*;
use vulcan_uefi::prelude::*;

mod menu;
use menu::{exactly_one_true, CompressModules, Modules};

fn color_level(level: Level) -> String {
    match level {
        Level::Error => level.red().to_string(),
        Level::Warn => level.yellow().to_string(),
        Level::Info => level.green().to_string(),
        Level::Debug => level.blue().to_string(),
        Level::Trace => level.purple().to_string(),
    }
}

const fn level_filter(verbose: usize) -> LevelFilter {
    match verbose {
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        5 => LevelFilter::Trace,
        //default to off
        _ => LevelFilter::Off,
    }
}

/// Prints the node tree the way the information panel shows it.
fn print_tree(engine: &FfsEngine, index: NodeId, depth: usize) {
    let model = engine.tree_model();
    let text = model.text(index);
    let label = if text.is_empty() {
        model.name(index).to_owned()
    } else {
        format!("{} | {}", model.name(index), text)
    };
    let size = model.header(index).len() + model.body(index).len();
    println!(
        "{:indent$}{} [{}] ({})",
        "",
        label,
        model.item_type(index),
        format_size(size),
        indent = depth * 2
    );
    for &child in model.children(index) {
        print_tree(engine, child, depth + 1);
    }
}

fn print_messages(engine: &FfsEngine) {
    for message in engine.messages() {
        match message.severity {
            Severity::Error => eprintln!("{}: {}", "error".red(), message.text),
            Severity::Warning => eprintln!("{}: {}", "warning".yellow(), message.text),
            Severity::Info => println!("{}: {}", "info".green(), message.text),
        }
    }
}

fn parse_image(path: &str) -> Result<(FfsEngine, Vec<u8>)> {
    log::info!("Parsing image {}", path);
    let image = std::fs::read(path).with_context(|| format!("unable to read {path}"))?;
    let mut engine = FfsEngine::new();
    if let Err(error) = engine.parse_image_file(&image) {
        print_messages(&engine);
        bail!("image parsing failed: {error}");
    }
    Ok((engine, image))
}

fn output_or_extension(output: Option<String>, input: &str, extension: &str) -> String {
    output.unwrap_or_else(|| {
        let mut new_path = PathBuf::from(input);
        new_path.set_extension(extension);
        new_path.to_string_lossy().into_owned()
    })
}

fn main() -> Result<()> {
    //Parse command line input
    let args: menu::Vulcan = argp::parse_args_or_exit(argp::DEFAULT);

    // Build up a logger with custom formatting and set it to the verbosity from the command line
    if args.verbose != 0 {
        Builder::new()
            .format(|buf, record| {
                writeln!(buf, "{} {}", color_level(record.level()), record.args())
            })
            .filter(None, level_filter(args.verbose))
            .init();
    }

    match args.nested {
        Modules::Parse(params) => {
            let (engine, _) = parse_image(&params.input)?;
            let model = engine.tree_model();
            for &child in model.children(model.root()) {
                print_tree(&engine, child, 0);
            }
            print_messages(&engine);
        }
        Modules::Extract(params) => {
            let (mut engine, _) = parse_image(&params.input)?;
            let output = output_or_extension(params.output, &params.input, "dump");
            log::info!("Extracting to {}", output);
            let root = engine.tree_model().root();
            let index = engine
                .tree_model()
                .children(root)
                .first()
                .copied()
                .context("image tree is empty")?;
            engine
                .dump(index, Path::new(&output), params.guid.as_deref())
                .map_err(|error| anyhow::anyhow!("extraction failed: {error}"))?;
            print_messages(&engine);
        }
        Modules::Search(params) => {
            let (mut engine, _) = parse_image(&params.input)?;
            let scope = match params.scope.as_str() {
                "header" => SearchScope::Header,
                "body" => SearchScope::Body,
                "all" => SearchScope::All,
                other => bail!("unknown search scope {other}"),
            };
            let root = engine.tree_model().root();
            let index = engine
                .tree_model()
                .children(root)
                .first()
                .copied()
                .context("image tree is empty")?;
            let result = match (&params.hex, &params.guid, &params.text) {
                (Some(hex), None, None) => engine.find_hex_pattern(index, hex, scope),
                (None, Some(guid), None) => engine.find_guid_pattern(index, guid, scope),
                (None, None, Some(text)) => {
                    engine.find_text_pattern(index, text, params.unicode, params.case_sensitive)
                }
                _ => bail!("please select exactly one of --hex, --guid, --text"),
            };
            result.map_err(|error| anyhow::anyhow!("search failed: {error}"))?;
            print_messages(&engine);
        }
        Modules::Repack(params) => {
            let (mut engine, image) = parse_image(&params.input)?;
            let reconstructed = engine
                .reconstruct_image_file()
                .map_err(|error| anyhow::anyhow!("reconstruction failed: {error}"))?;
            print_messages(&engine);
            if reconstructed == image {
                log::info!("Round trip is byte-identical ({})", format_size(image.len()));
            } else {
                log::warn!(
                    "Round trip differs from input: {} in, {} out",
                    format_size(image.len()),
                    format_size(reconstructed.len())
                );
            }
            let output = output_or_extension(params.output, &params.input, "repack.bin");
            log::info!("Writing file {}", output);
            std::fs::write(output, reconstructed)?;
        }
        Modules::Compress(module) => match module.nested {
            CompressModules::Tiano(params) => {
                match exactly_one_true(&[params.decompress, params.compress]) {
                    Some(0) => {
                        log::info!("Decompressing file {}", &params.input);
                        let input = std::fs::read(&params.input)?;
                        let (data, variant) = tiano::decompress_from(&input)
                            .map_err(|error| anyhow::anyhow!("{error}"))?;
                        log::info!("Detected variant: {:?}", variant);
                        let output = output_or_extension(params.output, &params.input, "bin");
                        log::info!("Writing file {}", output);
                        std::fs::write(output, data)?;
                    }
                    Some(1) => {
                        log::info!("Compressing file {}", &params.input);
                        let input = std::fs::read(&params.input)?;
                        let variant =
                            if params.efi11 { Variant::Efi11 } else { Variant::Tiano };
                        let data = tiano::compress_from(&input, variant, Strategy::Legacy)
                            .map_err(|error| anyhow::anyhow!("{error}"))?;
                        let output = output_or_extension(params.output, &params.input, "tiano");
                        log::info!("Writing file {}", output);
                        std::fs::write(output, data)?;
                    }
                    None => eprintln!("Please select exactly one operation!"),
                    _ => unreachable!("Oops! Forgot to cover all operations."),
                }
            }
            CompressModules::Lzma(params) => {
                match exactly_one_true(&[params.decompress, params.compress]) {
                    Some(0) => {
                        log::info!("Decompressing file {}", &params.input);
                        let input = std::fs::read(&params.input)?;
                        let data = lzma::decompress_from(&input)
                            .map_err(|error| anyhow::anyhow!("{error}"))?;
                        let output = output_or_extension(params.output, &params.input, "bin");
                        log::info!("Writing file {}", output);
                        std::fs::write(output, data)?;
                    }
                    Some(1) => {
                        log::info!("Compressing file {}", &params.input);
                        let input = std::fs::read(&params.input)?;
                        let data = lzma::compress_from(&input, params.dictionary_size)
                            .map_err(|error| anyhow::anyhow!("{error}"))?;
                        let output = output_or_extension(params.output, &params.input, "lzma");
                        log::info!("Writing file {}", output);
                        std::fs::write(output, data)?;
                    }
                    None => eprintln!("Please select exactly one operation!"),
                    _ => unreachable!("Oops! Forgot to cover all operations."),
                }
            }
        },
    }

    Ok(())
}
