use oceanview::config::{Configuration, EndOfData};
use oceanview::descriptor::{Bounds, DataMode};
use std::path::PathBuf;
use std::time::Duration;

const TWO_SLOTS: &str = r#"
primary-dataset: "/data/run-a"
alternate-dataset: "/data/run-b"
grid:
  width: 320
  height: 160
  depth-levels: 42
latitude:
  min: -78.5
  max: 78.5
screens:
  rows: 1
  columns: 2
frame-interval: 250ms
end-of-data: wait
variables:
  TEMP:
    min: -2
    max: 30
    diff-min: -4
    diff-max: 4
    colormap: hotres
slots:
  - variable: TEMP
  - variable: TEMP
    mode: difference
    colormap: bluewhitered
"#;

#[test]
fn parse_kebab_case_config() {
    let cfg: Configuration = serde_yaml::from_str(TWO_SLOTS).unwrap();
    assert_eq!(cfg.primary_dataset, PathBuf::from("/data/run-a"));
    assert_eq!(cfg.alternate_dataset, Some(PathBuf::from("/data/run-b")));
    assert_eq!(cfg.grid.depth_levels, 42);
    assert_eq!(cfg.frame_interval, Duration::from_millis(250));
    assert_eq!(cfg.end_of_data, EndOfData::Wait);
    assert_eq!(cfg.slot_count(), 2);
    assert_eq!(cfg.slots[1].mode, DataMode::Difference);
    assert_eq!(cfg.slots[1].colormap.as_deref(), Some("bluewhitered"));
    assert_eq!(cfg.slots[0].log_scale, None);

    let temp = cfg.variable("TEMP");
    assert_eq!(temp.colormap, "hotres");
    assert_eq!(temp.bounds(DataMode::Primary), Bounds::new(-2.0, 30.0));
    assert_eq!(temp.bounds(DataMode::Difference), Bounds::new(-4.0, 4.0));
    cfg.validated().unwrap();
}

#[test]
fn defaults_fill_unset_fields() {
    let cfg: Configuration = serde_yaml::from_str(
        r#"
primary-dataset: "/d"
slots:
  - variable: SALT
"#,
    )
    .unwrap();
    assert_eq!(cfg.io_threads, 2);
    assert_eq!(cfg.cpu_threads, 0);
    assert!(cfg.cpu_workers() >= 1);
    assert_eq!(cfg.end_of_data, EndOfData::Loop);
    assert_eq!(cfg.display_interval, Duration::from_millis(50));
    assert_eq!(cfg.variable("SALT").colormap, "rainbow");
    let cfg = cfg.validated().unwrap();
    assert_eq!(cfg.slot_count(), 1);
}

#[test]
fn slot_count_must_match_screens() {
    let cfg: Configuration = serde_yaml::from_str(
        r#"
primary-dataset: "/d"
screens: { rows: 2, columns: 2 }
slots:
  - variable: TEMP
"#,
    )
    .unwrap();
    let err = cfg.validated().unwrap_err();
    assert!(err.to_string().contains("expected 4 slots"), "{err}");
}

#[test]
fn difference_slots_need_alternate_dataset() {
    let cfg: Configuration = serde_yaml::from_str(
        r#"
primary-dataset: "/d"
slots:
  - variable: TEMP
    mode: difference
"#,
    )
    .unwrap();
    let err = cfg.validated().unwrap_err();
    assert!(err.to_string().contains("alternate-dataset"), "{err}");
}

#[test]
fn inverted_variable_bounds_are_rejected() {
    let cfg: Configuration = serde_yaml::from_str(
        r#"
primary-dataset: "/d"
variables:
  TEMP: { min: 5, max: 1 }
slots:
  - variable: TEMP
"#,
    )
    .unwrap();
    assert!(cfg.validated().is_err());
}

#[test]
fn latitude_outside_globe_is_rejected() {
    let cfg: Configuration = serde_yaml::from_str(
        r#"
primary-dataset: "/d"
latitude: { min: -95, max: 90 }
slots:
  - variable: TEMP
"#,
    )
    .unwrap();
    assert!(cfg.validated().is_err());
}

#[test]
fn initial_depth_must_exist() {
    let cfg: Configuration = serde_yaml::from_str(
        r#"
primary-dataset: "/d"
grid: { width: 4, height: 2, depth-levels: 3 }
initial-depth: 3
slots:
  - variable: TEMP
"#,
    )
    .unwrap();
    assert!(cfg.validated().is_err());
}

#[test]
fn from_yaml_file_reads_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, TWO_SLOTS).unwrap();
    let cfg = Configuration::from_yaml_file(&path).unwrap();
    assert_eq!(cfg.latitude.min, -78.5);
    assert!(Configuration::from_yaml_file(dir.path().join("missing.yaml")).is_err());
}
