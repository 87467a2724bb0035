// 该文件是 Jiannan （剑南春风） 项目的一部分。
// src/labels.rs - 标签表
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum LabelLoadError {
  #[error("标签文件读取失败: {0}")]
  Io(#[from] std::io::Error),
  #[error("标签文件第 {0} 行格式错误: {1:?}")]
  BadLine(usize, String),
}

/// 类别编号到标签文本的静态映射。
///
/// 标签文件为逐行文本，每行格式为 `<空白>*<数字><文本>`，
/// 例如 `0  person`。启动时加载一次，此后只读。
/// 重复编号时后出现的行覆盖前面的行。
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
  map: HashMap<u32, String>,
}

impl LabelTable {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, LabelLoadError> {
    let path = path.as_ref();
    info!("加载标签文件: {}", path.display());

    let text = std::fs::read_to_string(path)?;
    let table = Self::parse(&text)?;

    info!("标签加载完成，共 {} 条", table.len());
    Ok(table)
  }

  pub fn parse(text: &str) -> Result<Self, LabelLoadError> {
    let mut map = HashMap::new();

    for (lineno, line) in text.lines().enumerate() {
      let rest = line.trim_start();
      let digits_end = rest
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit())
        .map(|(i, c)| i + c.len_utf8())
        .last();

      // 行必须以数字开头，且数字之后至少还有一个字符
      let Some(end) = digits_end else {
        return Err(LabelLoadError::BadLine(lineno + 1, line.to_string()));
      };
      let (digits, label) = rest.split_at(end);
      if label.is_empty() {
        return Err(LabelLoadError::BadLine(lineno + 1, line.to_string()));
      }

      let id: u32 = digits
        .parse()
        .map_err(|_| LabelLoadError::BadLine(lineno + 1, line.to_string()))?;

      // 重复编号：后写入者胜出
      map.insert(id, label.trim().to_string());
    }

    Ok(LabelTable { map })
  }

  /// 查询标签文本。未知编号返回编号本身的十进制字符串，永不失败。
  pub fn lookup(&self, class_id: u32) -> String {
    match self.map.get(&class_id) {
      Some(label) => label.clone(),
      None => class_id.to_string(),
    }
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }
}
