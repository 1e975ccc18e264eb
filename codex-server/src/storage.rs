//! 会话快照存储
//!
//! 每个会话一个 JSON 文件，每回合覆盖写入（后写者胜）。

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::session::SessionSnapshot;

/// 快照存储
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    saves_dir: PathBuf,
}

impl SnapshotStore {
    /// 创建存储；未指定目录时使用平台数据目录
    pub fn new(saves_dir: Option<PathBuf>) -> Result<Self> {
        let saves_dir = match saves_dir {
            Some(dir) => dir,
            None => get_saves_directory()?,
        };
        Self::at(saves_dir)
    }

    /// 使用指定目录
    pub fn at(saves_dir: impl Into<PathBuf>) -> Result<Self> {
        let saves_dir = saves_dir.into();
        if !saves_dir.exists() {
            fs::create_dir_all(&saves_dir)
                .with_context(|| format!("无法创建存储目录: {:?}", saves_dir))?;
        }
        Ok(Self { saves_dir })
    }

    /// 会话对应的快照文件
    pub fn path_for(&self, session_id: &str) -> PathBuf {
        self.saves_dir
            .join(format!("{}.json", sanitize_filename(session_id)))
    }

    /// 覆盖保存
    pub fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let filepath = self.path_for(&snapshot.session_id);
        let json_content =
            serde_json::to_string_pretty(snapshot).context("序列化会话快照失败")?;

        // 先写临时文件再改名，崩溃时不会留下半个快照
        let tmp = filepath.with_extension("json.tmp");
        fs::write(&tmp, json_content).with_context(|| format!("写入文件失败: {:?}", tmp))?;
        fs::rename(&tmp, &filepath)
            .with_context(|| format!("替换快照失败: {:?}", filepath))?;
        Ok(())
    }

    /// 读取快照；文件不存在时返回 None
    pub fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let filepath = self.path_for(session_id);
        if !filepath.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&filepath)
            .with_context(|| format!("读取文件失败: {:?}", filepath))?;
        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("解析会话快照失败: {:?}", filepath))?;
        Ok(Some(snapshot))
    }

    /// 删除快照
    pub fn delete(&self, session_id: &str) -> Result<()> {
        let filepath = self.path_for(session_id);
        if filepath.exists() {
            fs::remove_file(&filepath)
                .with_context(|| format!("删除文件失败: {:?}", filepath))?;
        }
        Ok(())
    }

    pub fn saves_directory(&self) -> &Path {
        &self.saves_dir
    }
}

/// 获取跨平台存储目录
fn get_saves_directory() -> Result<PathBuf> {
    let app_data_dir = dirs::data_dir().context("无法获取应用数据目录")?;
    Ok(app_data_dir.join("codex-naturalis").join("sessions"))
}

/// 清理文件名中的特殊字符
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '.' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}
