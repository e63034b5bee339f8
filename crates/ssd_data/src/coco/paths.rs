use std::fmt;
use std::path::{Path, PathBuf};

/// COCO 2017 split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Image folder and annotation file of one split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CocoPaths {
    pub image_dir: PathBuf,
    pub annotation_file: PathBuf,
}

/// Resolves the conventional COCO 2017 layout under `root`:
///
/// ```text
/// {root}/annotations/instances_{split}2017.json
/// {root}/{split}2017/
/// ```
///
/// Nothing is checked on disk; a missing path surfaces when it is opened.
pub fn locate(root: impl AsRef<Path>, split: Split) -> CocoPaths {
    let root = root.as_ref();
    CocoPaths {
        image_dir: root.join(format!("{}2017", split)),
        annotation_file: root
            .join("annotations")
            .join(format!("instances_{}2017.json", split)),
    }
}
