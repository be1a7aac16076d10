/// Check if a file path is safe to hand to the sandbox filesystem
/// (relative, no traversal, not empty)
pub fn is_safe_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return false;
    }
    if path.split(['/', '\\']).any(|part| part == "..") {
        return false;
    }
    true
}
