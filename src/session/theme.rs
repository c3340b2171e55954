//! 配置器主题
//!
//! 内核配置器（menuconfig）支持的固定主题列表。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::utils::error::ConfiguratorError;

/// 配置器主题
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    /// 经典主题的 LCD 友好版本（默认）
    #[default]
    Bluetitle,
    /// 适合单色显示器
    Mono,
    /// 黑色背景
    Blackbg,
    /// 蓝色背景的经典外观
    Classic,
}

impl Theme {
    /// 按展示顺序排列的全部主题，第一个为默认主题
    pub const ALL: [Theme; 4] = [Theme::Bluetitle, Theme::Mono, Theme::Blackbg, Theme::Classic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Theme::Bluetitle => "bluetitle",
            Theme::Mono => "mono",
            Theme::Blackbg => "blackbg",
            Theme::Classic => "classic",
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Theme {
    type Err = ConfiguratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Theme::ALL
            .into_iter()
            .find(|theme| theme.as_str() == s)
            .ok_or_else(|| ConfiguratorError::ThemeDoesNotExist(s.to_string()))
    }
}

/// 获取可用主题标识列表
pub fn available_themes() -> Vec<&'static str> {
    Theme::ALL.iter().map(Theme::as_str).collect()
}
