//! pkglink CLI - Tool for inspecting, loading and compressing packages.

use std::env;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use pkglink::core::{compress_file, decompress_file, CompressionFlags};
use pkglink::format::SAVING_COMPRESSION_CHUNK_SIZE;
use pkglink::io::ReaderOptions;
use pkglink::prelude::*;

/// Global flags parsed before the command.
struct Options {
    level: &'static str,
    json: bool,
    budget: Option<Duration>,
    search_paths: Vec<PathBuf>,
}

fn main() {
    let args: Vec<String> = env::args().collect();

    // Parse global flags
    let mut options = Options { level: "info", json: false, budget: None, search_paths: Vec::new() };
    let mut filtered_args: Vec<&str> = Vec::new();
    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" | "--verbose" => options.level = "debug",
            "-vv" | "--trace" => options.level = "trace",
            "-q" | "--quiet" => options.level = "error",
            "-j" | "--json" => options.json = true,
            "-b" | "--budget" => {
                let Some(ms) = iter.next().and_then(|v| v.parse::<u64>().ok()) else {
                    eprintln!("Error: --budget expects milliseconds");
                    std::process::exit(1);
                };
                options.budget = Some(Duration::from_millis(ms));
            }
            "-s" | "--search" => {
                let Some(dir) = iter.next() else {
                    eprintln!("Error: --search expects a directory");
                    std::process::exit(1);
                };
                options.search_paths.push(PathBuf::from(dir));
            }
            _ => filtered_args.push(arg),
        }
    }
    if options.json && options.level == "info" {
        options.level = "warn";
    }
    init_tracing(options.level);

    if filtered_args.is_empty() {
        print_help();
        return;
    }

    let result = match filtered_args[0] {
        "i" | "info" => with_file(&filtered_args, |f| cmd_info(f, &options)),
        "n" | "names" => with_file(&filtered_args, |f| cmd_names(f, &options)),
        "im" | "imports" => with_file(&filtered_args, |f| cmd_imports(f, &options)),
        "e" | "exports" => with_file(&filtered_args, |f| cmd_exports(f, &options)),
        "d" | "depends" => with_file(&filtered_args, |f| cmd_depends(f, &options)),
        "l" | "load" => with_file(&filtered_args, |f| cmd_load(f, &options)),
        "c" | "compress" => with_two_files(&filtered_args, |a, b| cmd_compress(a, b)),
        "x" | "decompress" => with_two_files(&filtered_args, |a, b| cmd_decompress(a, b)),
        "h" | "help" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        "--version" | "version" => {
            println!(
                "pkglink {} (built {} {})",
                env!("CARGO_PKG_VERSION"),
                env!("PKGLINK_BUILD_DATE"),
                env!("PKGLINK_BUILD_TIME")
            );
            Ok(())
        }
        other => {
            // Passing a package file directly is equivalent to 'info'
            if Path::new(other).exists() {
                cmd_info(other, &options)
            } else {
                eprintln!("Unknown command: {}", other);
                eprintln!();
                print_help();
                std::process::exit(1);
            }
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn with_file(args: &[&str], f: impl FnOnce(&str) -> Result<()>) -> Result<()> {
    match args.get(1) {
        Some(file) => f(file),
        None => bail!("missing file argument\nUsage: pkglink {} <file.pkg>", args[0]),
    }
}

fn with_two_files(args: &[&str], f: impl FnOnce(&str, &str) -> Result<()>) -> Result<()> {
    match (args.get(1), args.get(2)) {
        (Some(input), Some(output)) => f(input, output),
        _ => bail!("missing file arguments\nUsage: pkglink {} <in> <out>", args[0]),
    }
}

fn print_help() {
    println!("pkglink - package linker toolkit");
    println!();
    println!("USAGE:");
    println!("    pkglink [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    i,  info       <file>         Show summary, flags and table sizes");
    println!("    n,  names      <file>         List the name table");
    println!("    im, imports    <file>         List imports with their outers");
    println!("    e,  exports    <file>         List exports with class, size and offset");
    println!("    d,  depends    <file>         List the depends map per export");
    println!("    l,  load       <file|name>    Load a package through the async queue");
    println!("    c,  compress   <in> <out>     Compress a whole file with the chunk codec");
    println!("    x,  decompress <in> <out>     Restore a file written by 'compress'");
    println!("    h,  help                      Show this help");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose          Show debug output");
    println!("    -vv, --trace           Show trace output (very verbose)");
    println!("    -q, --quiet            Only show errors");
    println!("    -j, --json             Print results as JSON");
    println!("    -b, --budget <ms>      Frame budget for 'load' (default: unlimited)");
    println!("    -s, --search <dir>     Add a package search directory");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG               Overrides the log filter");
    println!("    PKGLINK_SEARCH_PATH    Extra package search directories");
    println!("    PKGLINK_IMPORTS        strict | lenient");
    println!("    PKGLINK_ASYNC_IO       1 to read through the background I/O thread");
    println!();
    println!("EXAMPLES:");
    println!("    pkglink info Props.pkg");
    println!("    pkglink exports Props.pkg --json");
    println!("    pkglink -b 5 -s content load Level01");
}

fn open_tables(path: &str) -> Result<LinkerLoad> {
    info!("Opening package: {}", path);
    let linker = LinkerLoad::load_tables(path, ReaderOptions::new())
        .with_context(|| format!("failed to open {}", path))?;
    debug!(
        names = linker.names().len(),
        imports = linker.imports().len(),
        exports = linker.exports().len(),
        "tables loaded"
    );
    Ok(linker)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_info(path: &str, options: &Options) -> Result<()> {
    let linker = open_tables(path)?;
    let summary = linker.summary();
    let generations: Vec<Value> = summary
        .generations
        .iter()
        .map(|g| json!({ "exports": g.export_count, "names": g.name_count, "net_objects": g.net_object_count }))
        .collect();

    if options.json {
        return print_json(&json!({
            "package": linker.package_name(),
            "file_version": summary.file_version(),
            "licensee_version": summary.licensee_version(),
            "engine_version": summary.engine_version,
            "cooked_content_version": summary.cooked_content_version,
            "byte_swapped": linker.is_byte_swapped(),
            "guid": summary.guid.to_string(),
            "package_flags": summary.package_flags.bits(),
            "folder_name": summary.folder_name,
            "total_header_size": summary.total_header_size,
            "names": linker.names().len(),
            "imports": linker.imports().len(),
            "exports": linker.exports().len(),
            "compression_flags": summary.compression_flags.0,
            "compressed_chunks": summary.compressed_chunks.len(),
            "generations": generations,
        }));
    }

    println!("Package: {} ({})", linker.package_name(), path);
    println!("Version: {} (licensee {})", summary.file_version(), summary.licensee_version());
    println!("Engine:  {} (cooked content {})", summary.engine_version, summary.cooked_content_version);
    println!("GUID:    {}", summary.guid);
    println!("Flags:   {:#010x}", summary.package_flags.bits());
    if !summary.folder_name.is_empty() {
        println!("Folder:  {}", summary.folder_name);
    }
    if linker.is_byte_swapped() {
        println!("Byte order: swapped");
    }
    println!();
    println!("Tables:");
    println!("  Names:   {}", linker.names().len());
    println!("  Imports: {}", linker.imports().len());
    println!("  Exports: {}", linker.exports().len());
    println!("  Header:  {} bytes", summary.total_header_size);
    if summary.is_compressed() {
        println!();
        println!(
            "Compression: {:#04x}, {} chunks",
            summary.compression_flags.0,
            summary.compressed_chunks.len()
        );
    }
    println!();
    println!("Generations: {}", summary.generations.len());
    for (i, g) in summary.generations.iter().enumerate() {
        println!("  [{}] exports={} names={}", i, g.export_count, g.name_count);
    }
    Ok(())
}

fn cmd_names(path: &str, options: &Options) -> Result<()> {
    let linker = open_tables(path)?;
    if options.json {
        let names: Vec<&str> = linker.names().iter().collect();
        return print_json(&json!(names));
    }
    for (i, name) in linker.names().iter().enumerate() {
        println!("{:5}  {}", i, name);
    }
    Ok(())
}

fn cmd_imports(path: &str, options: &Options) -> Result<()> {
    let linker = open_tables(path)?;
    if options.json {
        let imports: Vec<Value> = linker
            .imports()
            .iter()
            .enumerate()
            .map(|(i, import)| {
                json!({
                    "index": PackageIndex::from_import(i).raw(),
                    "class": format!("{}.{}", import.class_package, import.class_name),
                    "path": linker.import_path_name(i),
                    "outer": import.outer_index.raw(),
                })
            })
            .collect();
        return print_json(&json!(imports));
    }
    for i in 0..linker.imports().len() {
        println!("{:5}  {}", PackageIndex::from_import(i).raw(), linker.import_full_name(i));
    }
    Ok(())
}

fn cmd_exports(path: &str, options: &Options) -> Result<()> {
    let linker = open_tables(path)?;
    if options.json {
        let exports: Vec<Value> = linker
            .exports()
            .iter()
            .enumerate()
            .map(|(i, export)| {
                json!({
                    "index": PackageIndex::from_export(i).raw(),
                    "class": linker.export_class_name(i).to_string(),
                    "path": linker.export_path_name(i),
                    "outer": export.outer_index.raw(),
                    "archetype": export.archetype_index.raw(),
                    "super": export.super_index.raw(),
                    "object_flags": export.object_flags.bits(),
                    "export_flags": export.export_flags.bits(),
                    "serial_offset": export.serial_offset,
                    "serial_size": export.serial_size,
                })
            })
            .collect();
        return print_json(&json!(exports));
    }
    for (i, export) in linker.exports().iter().enumerate() {
        println!(
            "{:5}  {:<48} @{:<8} {:>8} bytes",
            PackageIndex::from_export(i).raw(),
            linker.export_full_name(i),
            export.serial_offset,
            export.serial_size
        );
    }
    Ok(())
}

fn cmd_depends(path: &str, options: &Options) -> Result<()> {
    let linker = open_tables(path)?;
    if options.json {
        let depends: Vec<Value> = linker
            .depends()
            .iter()
            .enumerate()
            .map(|(i, list)| {
                json!({
                    "export": linker.export_path_name(i),
                    "depends": list.iter().map(|d| linker.index_path_name(*d)).collect::<Vec<_>>(),
                })
            })
            .collect();
        return print_json(&json!(depends));
    }
    for (i, list) in linker.depends().iter().enumerate() {
        println!("{}", linker.export_path_name(i));
        for dependency in list {
            println!("    {:5}  {}", dependency.raw(), linker.index_path_name(*dependency));
        }
    }
    Ok(())
}

fn cmd_load(target: &str, options: &Options) -> Result<()> {
    let mut config = LinkerConfig::from_env();
    config.search_paths.extend(options.search_paths.iter().cloned());
    let mut session = LoadSession::new(config);

    let path = Path::new(target);
    let package = if path.is_file() {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .context("package file has no name")?;
        session.register_package_path(name.clone(), path);
        name
    } else {
        target.to_string()
    };

    let mut queue = AsyncPackageQueue::new();
    queue.load_package_async(&package, None);

    let start = Instant::now();
    let mut frames = 0u32;
    loop {
        frames += 1;
        let status = queue.process_async_loading(&mut session, options.budget);
        debug!(frame = frames, percent = queue.async_load_percentage(&package), "tick");
        if status.is_done() {
            break;
        }
    }
    let elapsed = start.elapsed();

    let Some(root) = session.objects().find_package(&package) else {
        bail!("package {} failed to load", package);
    };
    let loaded = session.objects().iter().filter(|&(id, _)| session.objects().is_in(id, root)).count();
    let stats = session.stats();

    if options.json {
        return print_json(&json!({
            "package": package,
            "frames": frames,
            "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
            "objects": loaded,
            "linkers_created": stats.linkers_created,
            "bodies_read": stats.bodies_read,
            "imports_verified": stats.imports_verified,
            "redirectors_followed": stats.redirectors_followed,
        }));
    }

    println!("Loaded {} in {:.2?} over {} frame(s)", package, elapsed, frames);
    println!("  Objects:    {}", loaded);
    println!("  Linkers:    {}", stats.linkers_created);
    println!("  Bodies:     {}", stats.bodies_read);
    println!("  Imports:    {}", stats.imports_verified);
    println!("  Redirects:  {}", stats.redirectors_followed);
    Ok(())
}

fn cmd_compress(input: &str, output: &str) -> Result<()> {
    let start = Instant::now();
    let written = compress_file(input, output, CompressionFlags::ZLIB, SAVING_COMPRESSION_CHUNK_SIZE)
        .with_context(|| format!("failed to compress {}", input))?;
    println!("Compressed {} -> {} ({} bytes, {:.2?})", input, output, written, start.elapsed());
    Ok(())
}

fn cmd_decompress(input: &str, output: &str) -> Result<()> {
    let start = Instant::now();
    let written = decompress_file(input, output, CompressionFlags::ZLIB)
        .with_context(|| format!("failed to decompress {}", input))?;
    println!("Decompressed {} -> {} ({} bytes, {:.2?})", input, output, written, start.elapsed());
    Ok(())
}
