//! End-to-end: parameter file -> tables + mosaic -> train -> store -> score map.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use stem_ensemble::{EnsembleError, OobConfig, SetStatus, TrainerConfig, TrainingOrchestrator};
use stem_io::{
    IoError, KEPT_GEOJSON, RunConfig, RunStore, RunWriter, SampleReader, SetRecord, collect_records, read_mosaic,
    read_var_names, unscored_records, write_score_map,
};
use stem_tree::DecisionTree;
use tempfile::TempDir;
use tiff::encoder::{TiffEncoder, colortype};
use tiff::tags::Tag;

/// 20 x 20 lattice over `[0, 60) x (0, 60]`; class 1 east of x = 30.
fn write_samples(path: &Path) {
    let mut text = String::from("obs_id\tx\ty\tcover\tb_ndvi\tb_elev\tnotes\n");
    for i in 0..400 {
        let (col, row) = (i % 20, i / 20);
        let x = col as f64 * 3.0 + 1.5;
        let y = row as f64 * 3.0 + 1.5;
        let class = u8::from(x >= 30.0);
        text.push_str(&format!("{}\t{x}\t{y}\t{class}\t{}\t{}\tn/a\n", 1000 + i, x / 60.0, (i % 7) as f64));
    }
    fs::write(path, text).unwrap();
}

/// 20 x 20 pixels of 3 map units, origin (0, 60); the top-left 5 x 5 block is invalid.
fn write_mosaic(path: &Path) {
    let data: Vec<u8> = (0..400).map(|i| u8::from(!(i % 20 < 5 && i / 20 < 5))).collect();
    let file = File::create(path).unwrap();
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).unwrap();
    let mut image = encoder.new_image::<colortype::Gray8>(20, 20).unwrap();
    image
        .encoder()
        .write_tag(Tag::ModelPixelScaleTag, &[3.0, 3.0, 0.0][..])
        .unwrap();
    image
        .encoder()
        .write_tag(Tag::ModelTiepointTag, &[0.0, 0.0, 0.0, 0.0, 60.0, 0.0][..])
        .unwrap();
    image.write_data(&data).unwrap();
}

fn write_params(dir: &Path, extra: &str) -> PathBuf {
    write_samples(&dir.join("samples.txt"));
    fs::write(dir.join("vars.txt"), "var_name\nb_\n").unwrap();
    write_mosaic(&dir.join("mosaic.tif"));
    let d = dir.display();
    let text = format!(
        "sample_txt = \"{d}/samples.txt\"\n\
         target_col = \"cover\"\n\
         var_info = \"{d}/vars.txt\"\n\
         mosaic_path = \"{d}/mosaic.tif\"\n\
         out_dir = \"{d}/out\"\n\
         model_type = \"classifier\"\n\
         cell_size = [20.0, 20.0]\n\
         support_size = [30.0, 30.0]\n\
         sets_per_cell = 2\n\
         min_obs = 8\n\
         n_jobs = 2\n\
         n_tiles = [3, 4]\n\
         seed = 7\n\
         {extra}"
    );
    let path = dir.join("stem.toml");
    fs::write(&path, text).unwrap();
    path
}

fn stamp_time() -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 5, 1)
        .unwrap()
        .and_hms_opt(12, 30, 0)
        .unwrap()
}

#[test]
fn train_store_and_map_round_trip() {
    let dir = TempDir::new().unwrap();
    let params = write_params(dir.path(), "min_oob = 0.5\n");
    let config = RunConfig::load(&params).unwrap();
    let seed = config.seed.unwrap();

    // 1. Inputs
    let vars = read_var_names(&config.var_info).unwrap();
    let data = SampleReader::new(&config.sample_txt, &config.x_col, &config.y_col, &config.target_col)
        .read(&vars, &config.constant_vars)
        .unwrap();
    assert_eq!(data.table.predictor_names(), &["b_elev".to_string(), "b_ndvi".to_string()][..]);
    let mosaic = read_mosaic(&config.mosaic_path).unwrap();
    let study = mosaic.extent.valid_bounds(&mosaic.mask).unwrap();

    // 2. Train
    let run = RunWriter::create(&config.out_dir, &config.out_dirname, stamp_time()).unwrap();
    assert_eq!(run.stamp(), "cover_20260501_1230");
    run.copy_params(&params).unwrap();
    let sets = config.grid.clone().with_seed(seed).generate(&study).unwrap();
    let n_sets = sets.len();
    let trainer = TrainerConfig::new(config.model_type, run.model_dir())
        .with_file_prefix(run.stamp())
        .with_seed(seed);
    let report = TrainingOrchestrator::new(config.n_jobs)
        .unwrap()
        .run(sets, &data.table, &config.sampler.clone().with_seed(seed), &trainer)
        .unwrap();

    // 3. Score and persist
    let oob = config
        .oob
        .score(report.trained, &report.memberships, &data.table)
        .unwrap();
    let records = collect_records(&report.dropped, &oob);
    assert_eq!(records.len(), n_sets);

    let mut store = RunStore::create(&run.db_path()).unwrap();
    store.write_samples(&data.table).unwrap();
    store.write_memberships(&report.memberships).unwrap();
    store.write_sets(&records, data.table.predictor_names()).unwrap();
    let kept: Vec<SetRecord> = records
        .iter()
        .filter(|r| r.status == SetStatus::Kept)
        .cloned()
        .collect();
    assert!(!kept.is_empty());
    run.write_support_sets(&kept, data.table.predictor_names()).unwrap();
    run.write_footprints(KEPT_GEOJSON, &kept).unwrap();
    drop(store);

    // Every kept estimator reloads from its file.
    for r in &kept {
        let tree = DecisionTree::load(run.model_dir().join(r.dt_file.as_ref().unwrap())).unwrap();
        assert_eq!(tree.n_features(), 2);
    }

    // 4. Re-map from the store only, as `stem map` does.
    let reopened = RunWriter::open(run.run_dir()).unwrap();
    let params_copy = reopened.find_params().unwrap();
    let config = RunConfig::load(&params_copy).unwrap();
    let stored = RunStore::open(&reopened.db_path())
        .unwrap()
        .load_sets(Some(SetStatus::Kept))
        .unwrap();
    assert_eq!(stored.records, kept);

    let footprints: Vec<_> = stored
        .records
        .iter()
        .filter_map(|r| r.footprint(config.oob_map_metric))
        .collect();
    let map = config
        .score_map
        .map(&mosaic.extent, &mosaic.mask, &footprints)
        .unwrap();
    assert!(map.n_covered > 0);
    let paths = write_score_map(&map, reopened.run_dir(), reopened.stamp(), config.oob_map_metric).unwrap();
    assert!(paths.score.exists());
    assert!(paths.count.exists());

    let text = fs::read_to_string(reopened.run_dir().join("support_sets.txt")).unwrap();
    assert_eq!(text.lines().count(), kept.len() + 1);
}

#[test]
fn unknown_drop_column_still_records_trained_sets() {
    let dir = TempDir::new().unwrap();
    let params = write_params(dir.path(), "oob_drop = \"importance_slope > 0.5\"\n");
    let config = RunConfig::load(&params).unwrap();

    let vars = read_var_names(&config.var_info).unwrap();
    let data = SampleReader::new(&config.sample_txt, "x", "y", "cover")
        .read(&vars, &[])
        .unwrap();
    let mosaic = read_mosaic(&config.mosaic_path).unwrap();
    let run = RunWriter::create(&config.out_dir, "cover", stamp_time()).unwrap();
    let sets = config
        .grid
        .clone()
        .generate(&mosaic.extent.valid_bounds(&mosaic.mask).unwrap())
        .unwrap();
    let report = TrainingOrchestrator::new(1)
        .unwrap()
        .run(
            sets,
            &data.table,
            &config.sampler,
            &TrainerConfig::new(config.model_type, run.model_dir()),
        )
        .unwrap();

    let fallback = unscored_records(&report.dropped, &report.trained);
    let n_trained = report.trained.len();
    let err = config
        .oob
        .score(report.trained, &report.memberships, &data.table)
        .unwrap_err();
    assert!(matches!(err, EnsembleError::UnknownDropColumn { .. }));

    let mut store = RunStore::create(&run.db_path()).unwrap();
    store.write_sets(&fallback, data.table.predictor_names()).unwrap();
    let stored = store.load_sets(Some(SetStatus::Unscored)).unwrap();
    assert_eq!(stored.records.len(), n_trained);
}

#[test]
fn misspelled_parameter_is_rejected_before_training() {
    let dir = TempDir::new().unwrap();
    let params = write_params(dir.path(), "min_ob = 3\n");
    let err = RunConfig::load(&params).unwrap_err();
    assert!(matches!(err, IoError::ParseParams { .. }));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn oob_config_from_params_matches_model_type() {
    let dir = TempDir::new().unwrap();
    let params = write_params(dir.path(), "min_oob = 0.25\n");
    let config = RunConfig::load(&params).unwrap();
    let expected = OobConfig::new(config.model_type).with_min_oob(Some(0.25));
    assert_eq!(config.oob.min_oob(), expected.min_oob());
}
