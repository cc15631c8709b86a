use std::{
    fs,
    path::{Path, PathBuf},
};

pub const SUPPORTED_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

pub fn get_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_lowercase())
}

pub fn is_supported_image(path: &Path) -> bool {
    get_extension(path)
        .map(|ext| SUPPORTED_IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// `root` 下的直接子目录（跳过隐藏目录），按名称排序
pub fn list_class_dirs(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() && !is_hidden(&path) {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// `class_dir` 下的图片文件，按名称排序，最多 `limit` 个
pub fn list_class_images(class_dir: &Path, limit: usize) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(class_dir)? {
        let path = entry?.path();
        if path.is_file() && !is_hidden(&path) && is_supported_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    images.truncate(limit);
    Ok(images)
}

/// 相对 `root` 的路径，统一用 `/` 连接，与平台分隔符无关
pub fn corpus_identity(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
