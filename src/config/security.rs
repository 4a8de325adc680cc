use crate::errors::PatchvalError;

/// Keys whose values are filesystem locations.
const PATH_KEYS: &[&str] = &["workdir", "patch_path", "local_root", "scratch_dir", "directory"];

/// Keys that name locations inside the sandbox and must be absolute.
const SANDBOX_ABSOLUTE_KEYS: &[&str] = &["workdir", "patch_path"];

pub fn validate_security_patterns(value: &serde_yaml::Value) -> Result<(), PatchvalError> {
    check_value(value, &[])
}

fn check_value(value: &serde_yaml::Value, path: &[String]) -> Result<(), PatchvalError> {
    match value {
        serde_yaml::Value::String(s) => {
            let Some(key) = path.last() else {
                return Ok(());
            };
            if !PATH_KEYS.contains(&key.as_str()) {
                return Ok(());
            }
            let path_str = path.join(".");
            if s.split(['/', '\\']).any(|part| part == "..") {
                return Err(PatchvalError::Config(format!(
                    "Parent directory reference in path at config path: {}",
                    path_str
                )));
            }
            let in_sandbox = path.first().map(String::as_str) == Some("sandbox");
            if in_sandbox && SANDBOX_ABSOLUTE_KEYS.contains(&key.as_str()) && !s.starts_with('/') {
                return Err(PatchvalError::Config(format!(
                    "Sandbox path must be absolute at config path: {} ('{}')",
                    path_str, s
                )));
            }
            Ok(())
        }
        serde_yaml::Value::Mapping(map) => {
            for (k, v) in map {
                let key = k.as_str().unwrap_or("unknown").to_string();
                let mut new_path = path.to_vec();
                new_path.push(key);
                check_value(v, &new_path)?;
            }
            Ok(())
        }
        serde_yaml::Value::Sequence(seq) => {
            for (i, v) in seq.iter().enumerate() {
                let mut new_path = path.to_vec();
                new_path.push(format!("[{}]", i));
                check_value(v, &new_path)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
