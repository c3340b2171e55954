//! 镜像数据存储
//!
//! 查找镜像记录，并在会话结束时把配置器生成的内核配置合并进记录的属性。
//!
//! ## 功能
//! - ImageStore trait：镜像查找和属性持久化
//! - JsonFileImageStore：基于 JSON 文件的存储
//! - MemoryImageStore：内存存储（用于测试和嵌入）
//! - 配置文件读取和属性序列化

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::utils::error::ConfiguratorError;

/// 内核配置在镜像属性中的键
pub const KERNEL_CONFIG_PROP: &str = "PIEMAN_KERNEL_CONFIG";

/// 属性集合
pub type Props = Map<String, Value>;

/// 镜像记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image_id: String,
    #[serde(default)]
    pub props: Props,
}

/// 镜像数据存储
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// 查找镜像，不存在时返回 None
    async fn lookup_image(&self, image_id: &str) -> Result<Option<ImageRecord>, ConfiguratorError>;

    /// 写回镜像属性
    async fn persist(&self, image_id: &str, props: Props) -> Result<(), ConfiguratorError>;
}

/// 存储文件格式
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    images: HashMap<String, StoredImage>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredImage {
    #[serde(default)]
    props: Props,
}

/// 基于 JSON 文件的镜像存储
///
/// 文件格式：`{"images": {"<image_id>": {"props": {...}}}}`
pub struct JsonFileImageStore {
    path: PathBuf,
    /// 串行化读-改-写
    lock: Mutex<()>,
}

impl JsonFileImageStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<StoreFile, ConfiguratorError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(ConfiguratorError::StoreError(format!(
                "读取 {} 失败: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write_file(&self, file: &StoreFile) -> Result<(), ConfiguratorError> {
        let bytes = serde_json::to_vec_pretty(file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ImageStore for JsonFileImageStore {
    async fn lookup_image(&self, image_id: &str) -> Result<Option<ImageRecord>, ConfiguratorError> {
        let _guard = self.lock.lock().await;
        let file = self.read_file().await?;
        Ok(file.images.get(image_id).map(|image| ImageRecord {
            image_id: image_id.to_string(),
            props: image.props.clone(),
        }))
    }

    async fn persist(&self, image_id: &str, props: Props) -> Result<(), ConfiguratorError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read_file().await?;
        let image = file
            .images
            .get_mut(image_id)
            .ok_or_else(|| ConfiguratorError::ImageMissing(image_id.to_string()))?;
        image.props = props;
        self.write_file(&file).await?;

        tracing::debug!("镜像 {} 的属性已写入 {}", image_id, self.path.display());
        Ok(())
    }
}

/// 内存镜像存储
#[derive(Default)]
pub struct MemoryImageStore {
    images: Mutex<HashMap<String, Props>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加镜像
    pub async fn insert(&self, image_id: impl Into<String>, props: Props) {
        self.images.lock().await.insert(image_id.into(), props);
    }

    /// 获取镜像属性
    pub async fn props(&self, image_id: &str) -> Option<Props> {
        self.images.lock().await.get(image_id).cloned()
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn lookup_image(&self, image_id: &str) -> Result<Option<ImageRecord>, ConfiguratorError> {
        Ok(self.images.lock().await.get(image_id).map(|props| ImageRecord {
            image_id: image_id.to_string(),
            props: props.clone(),
        }))
    }

    async fn persist(&self, image_id: &str, props: Props) -> Result<(), ConfiguratorError> {
        let mut images = self.images.lock().await;
        match images.get_mut(image_id) {
            Some(existing) => {
                *existing = props;
                Ok(())
            }
            None => Err(ConfiguratorError::ImageMissing(image_id.to_string())),
        }
    }
}

/// 把属性值序列化为字符串
///
/// 布尔值写成 `"true"`/`"false"`，数字写成十进制文本，其余值不变。
pub fn serialize_props(props: &mut Props) {
    for value in props.values_mut() {
        let text = match value {
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        *value = Value::String(text);
    }
}

/// 读取配置器生成的配置文件，文件不存在时返回 None
pub async fn load_artifact(path: &Path) -> Result<Option<String>, ConfiguratorError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// 把会话的内核配置合并进镜像记录
///
/// 返回是否找到了配置文件。配置文件不存在不是错误，
/// 配置器可能在保存之前就退出了。
pub async fn save_kernel_config(
    store: &dyn ImageStore,
    image_id: &str,
    artifact_path: &Path,
) -> Result<bool, ConfiguratorError> {
    let Some(kernel_config) = load_artifact(artifact_path).await? else {
        return Ok(false);
    };

    let record = store
        .lookup_image(image_id)
        .await?
        .ok_or_else(|| ConfiguratorError::ImageMissing(image_id.to_string()))?;

    let mut props = record.props;
    props.insert(KERNEL_CONFIG_PROP.to_string(), Value::String(kernel_config));
    serialize_props(&mut props);

    store.persist(image_id, props).await?;
    tracing::info!("内核配置已保存到镜像 {}", image_id);
    Ok(true)
}
