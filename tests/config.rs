// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
use std::io::Write;

use fod_sentinel::config::{EncodeFormat, Route, StillImage};
use fod_sentinel::detection::TaskHead;
use fod_sentinel::{Args, ConfigError, ModelInfo, YOLOTask};

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let args = Args::load(&dir.path().join("model_args.toml")).unwrap();
    assert_eq!(args.width, Args::default().width);
    assert_eq!(args.destinations, 3);
    assert!(args.routes.is_empty());
}

#[test]
fn loads_routes_and_still_images_from_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
model = "models/fod-seg.onnx"
task = "segment"
nm = 32
width = 640
height = 384
destinations = 2
image_format = "jpeg"

[[routes]]
destination = 0
source = 2

[[routes]]
destination = 1
source = 2

[[still_images]]
source = 7
path = "demo/belt.png"
"#
    )
    .unwrap();

    let args = Args::load(file.path()).unwrap();
    assert_eq!(args.task, YOLOTask::Segment);
    assert_eq!(args.image_format, EncodeFormat::Jpeg);
    assert_eq!(
        args.routes,
        vec![
            Route {
                destination: 0,
                source: 2
            },
            Route {
                destination: 1,
                source: 2
            },
        ]
    );
    assert_eq!(
        args.still_images,
        vec![StillImage {
            source: 7,
            path: "demo/belt.png".into()
        }]
    );

    let info = ModelInfo::from_args(&args).unwrap();
    assert_eq!(info.head, TaskHead::Segment { nm: 32 });
    assert_eq!((info.width, info.height), (640, 384));
}

#[test]
fn invalid_file_is_rejected() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "destinations = 0").unwrap();
    assert!(matches!(
        Args::load(file.path()),
        Err(ConfigError::Invalid(_))
    ));

    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "conf = \"high\"").unwrap();
    assert!(matches!(Args::load(file.path()), Err(ConfigError::Load(_))));
}

#[test]
fn pose_without_keypoint_count_is_rejected() {
    let args = Args {
        task: YOLOTask::Pose,
        nk: None,
        ..Args::default()
    };
    assert!(ModelInfo::from_args(&args).is_err());
}
