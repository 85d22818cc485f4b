use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use image::{ImageBuffer, Rgb};
use serde_json::Value;
use tempfile::tempdir;
use w2x_core::Model;

/// Two 3×3 layers, 1 -> 2 -> 1, that average back to the input on flat regions.
const TINY_MODEL_JSON: &str = r#"[
    {"nInputPlane": 1, "nOutputPlane": 2, "kW": 3, "kH": 3,
     "weight": [[[[0, 0, 0], [0, 1, 0], [0, 0, 0]]],
                [[[0, 0, 0], [0, 1, 0], [0, 0, 0]]]],
     "bias": [0.0, 0.0]},
    {"nInputPlane": 2, "nOutputPlane": 1, "kW": 3, "kH": 3,
     "weight": [[[[0, 0, 0], [0, 0.5, 0], [0, 0, 0]],
                 [[0, 0, 0], [0, 0.5, 0], [0, 0, 0]]]],
     "bias": [0.0]}
]"#;

fn write_model(dir: &Path) -> Result<PathBuf, Box<dyn Error>> {
    let path = dir.join("tiny_model.json");
    fs::write(&path, TINY_MODEL_JSON)?;
    Ok(path)
}

fn write_image(path: &Path, width: u32, height: u32) -> Result<(), Box<dyn Error>> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        let r = ((x * 13 + y * 7) % 255) as u8;
        Rgb([r, 128, 255u8.saturating_sub(r)])
    });
    img.save(path)?;
    Ok(())
}

#[test]
fn convert_single_image_doubles_its_size() -> Result<(), Box<dyn Error>> {
    let work_dir = tempdir()?;
    let model = write_model(work_dir.path())?;
    let input = work_dir.path().join("sample.png");
    let output = work_dir.path().join("sample_x2.png");
    let report = work_dir.path().join("report.json");
    write_image(&input, 20, 12)?;

    cargo_bin_cmd!("w2x")
        .args(["convert", "--no-gpu", "--scale", "2", "--block-size", "16"])
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .arg("--model")
        .arg(&model)
        .arg("--report")
        .arg(&report)
        .assert()
        .success();

    let converted = image::open(&output)?;
    assert_eq!((converted.width(), converted.height()), (40, 24));

    let records: Value = serde_json::from_str(&fs::read_to_string(&report)?)?;
    let records = records.as_array().expect("report is a JSON array");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["backend"], "cpu");
    assert_eq!(records[0]["output_size"], serde_json::json!([40, 24]));
    Ok(())
}

#[test]
fn convert_directory_mirrors_layout() -> Result<(), Box<dyn Error>> {
    let work_dir = tempdir()?;
    let model = write_model(work_dir.path())?;
    let input_dir = work_dir.path().join("input");
    let output_dir = work_dir.path().join("output");
    fs::create_dir_all(input_dir.join("nested"))?;
    write_image(&input_dir.join("a.png"), 8, 8)?;
    write_image(&input_dir.join("nested").join("b.png"), 5, 9)?;
    fs::write(input_dir.join("readme.txt"), "not an image")?;

    cargo_bin_cmd!("w2x")
        .args(["convert", "--no-gpu", "--scale", "1", "--no-tiling"])
        .arg("-i")
        .arg(&input_dir)
        .arg("-o")
        .arg(&output_dir)
        .arg("-m")
        .arg(&model)
        .assert()
        .success();

    let a = image::open(output_dir.join("a.png"))?;
    let b = image::open(output_dir.join("nested").join("b.png"))?;
    assert_eq!((a.width(), a.height()), (8, 8));
    assert_eq!((b.width(), b.height()), (5, 9));
    assert!(!output_dir.join("readme.txt").exists());
    Ok(())
}

#[test]
fn export_model_writes_loadable_binary() -> Result<(), Box<dyn Error>> {
    let work_dir = tempdir()?;
    let json = write_model(work_dir.path())?;
    let binary = work_dir.path().join("models").join("tiny_model.bin");

    cargo_bin_cmd!("w2x")
        .arg("export-model")
        .arg("--input")
        .arg(&json)
        .arg("--output")
        .arg(&binary)
        .assert()
        .success();

    let from_json = Model::load(&json)?;
    let from_binary = Model::load(&binary)?;
    assert_eq!(from_binary, from_json);
    Ok(())
}

#[test]
fn missing_model_fails() -> Result<(), Box<dyn Error>> {
    let work_dir = tempdir()?;
    let input = work_dir.path().join("sample.png");
    write_image(&input, 4, 4)?;

    cargo_bin_cmd!("w2x")
        .args(["convert", "--no-gpu"])
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(work_dir.path().join("out.png"))
        .arg("--model")
        .arg(work_dir.path().join("absent.bin"))
        .assert()
        .failure();
    Ok(())
}

#[test]
fn malformed_model_fails() -> Result<(), Box<dyn Error>> {
    let work_dir = tempdir()?;
    let model = work_dir.path().join("broken.bin");
    fs::write(&model, [1u8, 0, 0, 0, 1, 0])?;
    let input = work_dir.path().join("sample.png");
    write_image(&input, 4, 4)?;

    cargo_bin_cmd!("w2x")
        .args(["convert", "--no-gpu"])
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(work_dir.path().join("out.png"))
        .arg("--model")
        .arg(&model)
        .assert()
        .failure();
    Ok(())
}
