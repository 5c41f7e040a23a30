use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

use senc::Dialect;

mod catalog;
mod codes;
mod geojson;

use catalog::Catalog;
use codes::CodeTables;
use geojson::{cell_to_features, features_to_chart, group_charts, read_collection, Feature};

/// Chart converter: SENC/S57 cells to GeoJSON layers, GeoJSON layers to
/// cells, and SENC to S57.
#[derive(Parser, Debug, Clone)]
#[command(name = "chartconv", version)]
struct Args {
    /// Input files or directories (.senc / .S57 cells, or .json / .geojson layers)
    #[arg(required = true, env = "CHARTCONV_INPUT", value_delimiter = ',')]
    input: Vec<PathBuf>,

    /// Output directory
    #[arg(short, long, default_value = ".", env = "CHARTCONV_OUTPUT")]
    output: PathBuf,

    /// Transcode SENC cells to S57
    #[arg(short = 's', long = "s57", env = "CHARTCONV_S57")]
    s57: bool,

    /// Encode GeoJSON to SENC (.senc) instead of S57 (.S57)
    #[arg(long, env = "CHARTCONV_SENC")]
    senc: bool,

    /// S-57 object class table (default: s57objectclasses.csv next to the input)
    #[arg(long, env = "CHARTCONV_OBJECT_CLASSES")]
    object_classes: Option<PathBuf>,

    /// S-57 attribute table (default: s57attributes.csv next to the input)
    #[arg(long, env = "CHARTCONV_ATTRIBUTES")]
    attributes: Option<PathBuf>,

    /// Catalog JSON overriding cell title, scale, edition, update and dates
    #[arg(long, env = "CHARTCONV_CATALOG")]
    catalog: Option<PathBuf>,

    /// Keep sounding clusters as 3D MultiPoints instead of one Point per sounding
    #[arg(long, env = "CHARTCONV_MULTIPOINTS")]
    multipoints: bool,

    /// Replace existing outputs
    #[arg(long, env = "CHARTCONV_OVERWRITE")]
    overwrite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputKind {
    Cell(Dialect),
    Layer,
}

fn input_kind(path: &Path) -> Option<InputKind> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "senc" => Some(InputKind::Cell(Dialect::Senc)),
        "s57" => Some(InputKind::Cell(Dialect::S57)),
        "json" | "geojson" => Some(InputKind::Layer),
        _ => None,
    }
}

/// Expand directories and keep the files we know how to read.
fn collect_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for input in inputs {
        for entry in WalkDir::new(input)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.into_path();
            if input_kind(&path).is_some() {
                files.push(path);
            }
        }
    }

    files
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned()
}

/// An explicit table path, or `name` next to the first input.
fn table_path(explicit: &Option<PathBuf>, files: &[PathBuf], name: &str) -> PathBuf {
    match explicit {
        Some(path) => path.clone(),
        None => files
            .first()
            .and_then(|f| f.parent())
            .map(|dir| dir.join(name))
            .unwrap_or_else(|| PathBuf::from(name)),
    }
}

fn load_codes(args: &Args, files: &[PathBuf]) -> Result<CodeTables> {
    let objects = table_path(&args.object_classes, files, "s57objectclasses.csv");
    let attributes = table_path(&args.attributes, files, "s57attributes.csv");

    CodeTables::load(&objects, &attributes).context("loading S-57 code tables")
}

/// `ChartInfo:<output dir name>`, read by chart plotters next to the cells.
fn write_chartinfo(out: &Path) -> Result<()> {
    let name = fs::canonicalize(out)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| out.display().to_string());

    fs::write(out.join("Chartinfo.txt"), format!("ChartInfo:{name}\n"))?;
    Ok(())
}

fn skip_existing(path: &Path, args: &Args) -> bool {
    if path.exists() && !args.overwrite {
        debug!("Skipping existing file: {}", path.display());
        return true;
    }
    false
}

fn transcode_one(path: &Path, args: &Args) -> Result<()> {
    let out_path = args.output.join(format!("{}.S57", stem(path)));
    if skip_existing(&out_path, args) {
        return Ok(());
    }

    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let s57 = senc::senc_to_s57(&bytes)?;
    fs::write(&out_path, &s57).with_context(|| format!("writing {}", out_path.display()))?;

    info!(
        "OK {} -> {} ({} bytes)",
        path.display(),
        out_path.display(),
        s57.len()
    );
    Ok(())
}

fn transcode_cells(args: &Args, files: &[PathBuf]) -> Result<()> {
    write_chartinfo(&args.output)?;

    let cells: Vec<&PathBuf> = files
        .iter()
        .filter(|f| input_kind(f) == Some(InputKind::Cell(Dialect::Senc)))
        .collect();
    info!("Transcoding {} cells...", cells.len());

    cells.par_iter().for_each(|path| {
        if let Err(err) = transcode_one(path, args) {
            warn!("Error processing {}: {:#}", path.display(), err);
        }
    });

    Ok(())
}

fn decode_one(path: &Path, args: &Args, codes: &CodeTables) -> Result<Vec<Feature>> {
    let decoded = senc::read_file(path).with_context(|| format!("decoding {}", path.display()))?;

    for text in &decoded.texts {
        // Attachment names are bare file names; never leave the output directory.
        let Some(name) = Path::new(&text.file).file_name() else {
            warn!("{}: text attachment without a file name", path.display());
            continue;
        };
        fs::write(args.output.join(name), &text.text)?;
    }

    let features = cell_to_features(&decoded, &stem(path), codes, args.multipoints);
    info!("OK {} ({} features)", path.display(), features.len());

    Ok(features)
}

fn decode_cells(args: &Args, files: &[PathBuf]) -> Result<()> {
    let codes = load_codes(args, files)?;

    let cells: Vec<&PathBuf> = files
        .iter()
        .filter(|f| matches!(input_kind(f), Some(InputKind::Cell(_))))
        .collect();
    info!("Decoding {} cells...", cells.len());

    let decoded: Vec<Vec<Feature>> = cells
        .par_iter()
        .filter_map(|path| match decode_one(path, args, &codes) {
            Ok(features) => Some(features),
            Err(err) => {
                warn!("Error processing {}: {:#}", path.display(), err);
                None
            }
        })
        .collect();

    let mut layers: BTreeMap<&str, Vec<&Feature>> = BTreeMap::new();
    for f in decoded.iter().flatten() {
        layers.entry(f.layer()).or_default().push(f);
    }

    for (layer, features) in &layers {
        let out_path = args.output.join(format!("{layer}.json"));
        if skip_existing(&out_path, args) {
            continue;
        }
        geojson::write_collection(&out_path, features)?;
        info!("{layer}: {} features", features.len());
    }

    Ok(())
}

fn encode_layers(args: &Args, files: &[PathBuf]) -> Result<()> {
    let codes = load_codes(args, files)?;
    let catalog = match &args.catalog {
        Some(path) => {
            let catalog = Catalog::load(path)?;
            debug!("catalog: {} cells", catalog.len());
            Some(catalog)
        }
        None => None,
    };

    let mut features = Vec::new();
    for path in files.iter().filter(|f| input_kind(f) == Some(InputKind::Layer)) {
        features.extend(read_collection(path)?);
    }

    let charts = group_charts(&features);
    info!("{} features, {} charts", features.len(), charts.len());

    let (dialect, ext) = if args.senc {
        (Dialect::Senc, "senc")
    } else {
        (Dialect::S57, "S57")
    };
    let created = chrono::Local::now().format("%Y%m%d").to_string();

    write_chartinfo(&args.output)?;

    charts.par_iter().for_each(|(chart, members)| {
        let out_path = args.output.join(format!("{chart}.{ext}"));
        if skip_existing(&out_path, args) {
            return;
        }

        let result = features_to_chart(chart, members, &codes, catalog.as_ref(), &created)
            .and_then(|input| {
                let bytes = senc::write_file(&out_path, &input.cell, &input.features, dialect)?;
                Ok((input.features.len(), bytes))
            });

        match result {
            Ok((n, bytes)) => info!(
                "OK {chart} -> {} ({n} features, {bytes} bytes)",
                out_path.display()
            ),
            Err(err) => warn!("Error processing chart {chart}: {:#}", err),
        }
    });

    Ok(())
}

fn run(args: &Args) -> Result<()> {
    fs::create_dir_all(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;

    let files = collect_inputs(&args.input);
    if files.is_empty() {
        warn!("No .senc, .S57 or .json inputs found");
        return Ok(());
    }

    if args.s57 {
        return transcode_cells(args, &files);
    }

    match input_kind(&files[0]) {
        Some(InputKind::Layer) => encode_layers(args, &files),
        _ => decode_cells(args, &files),
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    run(&args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes::tests::{ATTRIBUTES, OBJECTS};
    use serde_json::json;

    fn args(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("chartconv").chain(argv.iter().copied()))
    }

    fn write_tables(dir: &Path) {
        fs::write(dir.join("s57objectclasses.csv"), OBJECTS).unwrap();
        fs::write(dir.join("s57attributes.csv"), ATTRIBUTES).unwrap();
    }

    #[test]
    fn inputs_are_filtered_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.senc", "b.S57", "c.json", "d.txt", "s57attributes.csv"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }

        let files = collect_inputs(&[dir.path().to_path_buf()]);
        let names: Vec<String> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.senc", "b.S57", "c.json"]);
        assert_eq!(input_kind(&files[1]), Some(InputKind::Cell(Dialect::S57)));
    }

    #[test]
    fn layers_to_cells_and_back() {
        let src = tempfile::tempdir().unwrap();
        let cells = tempfile::tempdir().unwrap();
        let layers = tempfile::tempdir().unwrap();
        write_tables(src.path());
        write_tables(cells.path());

        let depare = json!({"type": "FeatureCollection", "features": [
            {"type": "Feature",
             "geometry": {"type": "Polygon", "coordinates": [[
                 [8.0, 54.0], [8.2, 54.0], [8.2, 54.2], [8.0, 54.2], [8.0, 54.0]
             ]]},
             "properties": {"chart": "1U4EL005", "uband": 5, "DRVAL1": 2.5}}
        ]});
        let lights = json!({"type": "FeatureCollection", "features": [
            {"type": "Feature",
             "geometry": {"type": "Point", "coordinates": [8.1, 54.1]},
             "properties": {"uband": 5, "OBJNAM": "Elbe 1"}}
        ]});
        fs::write(src.path().join("DEPARE.json"), depare.to_string()).unwrap();
        fs::write(src.path().join("LIGHTS.json"), lights.to_string()).unwrap();

        let out = cells.path().to_string_lossy().into_owned();
        run(&args(&[src.path().to_str().unwrap(), "-o", &out, "--senc"])).unwrap();

        assert!(cells.path().join("1U4EL005.senc").exists());
        let info = fs::read_to_string(cells.path().join("Chartinfo.txt")).unwrap();
        assert!(info.starts_with("ChartInfo:"));

        let out = layers.path().to_string_lossy().into_owned();
        run(&args(&[cells.path().to_str().unwrap(), "-o", &out])).unwrap();

        let back = read_collection(&layers.path().join("LIGHTS.json")).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].properties["OBJNAM"], "Elbe 1");
        assert_eq!(back[0].properties["chart"], "1U4EL005");

        let back = read_collection(&layers.path().join("DEPARE.json")).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].properties["DRVAL1"], 2.5);
        assert!(matches!(&back[0].geometry, geojson::Geometry::Polygon(r) if r[0].len() == 5));
    }

    #[test]
    fn senc_cells_transcode_to_s57() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();

        let line = vec![[8.0, 54.0], [8.05, 54.03], [8.1, 54.0]];
        let mut reversed = line.clone();
        reversed.reverse();
        let features = vec![
            senc::ChartFeature::new(30, senc::Shape::Line(vec![line])),
            senc::ChartFeature::new(30, senc::Shape::Line(vec![reversed])),
        ];
        let cell = senc::Cell::from_features("1U4EL005", &features).unwrap();
        senc::write_file(src.path().join("1U4EL005.senc"), &cell, &features, Dialect::Senc)
            .unwrap();

        let out_dir = out.path().to_string_lossy().into_owned();
        run(&args(&[src.path().to_str().unwrap(), "-s", "-o", &out_dir])).unwrap();

        let s57 = out.path().join("1U4EL005.S57");
        let decoded = senc::read_file(&s57).unwrap();
        assert_eq!(decoded.dialect, Dialect::S57);
        assert_eq!(decoded.features.len(), 2);
        assert!(out.path().join("Chartinfo.txt").exists());
    }
}
