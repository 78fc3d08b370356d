use anyhow::Result;
use url::Url;

use crate::config::Config;

/// 只接受可以作为基准的 http/https URL
pub fn is_valid_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.has_host(),
        Err(_) => false,
    }
}

pub fn validate_urls(urls: &[String]) -> Result<()> {
    if urls.is_empty() {
        anyhow::bail!("未提供任何URL。请通过命令行参数或文件提供至少一个URL。");
    }
    if let Some(invalid) = urls.iter().find(|url| !is_valid_url(url)) {
        anyhow::bail!("无效的URL: {}", invalid);
    }
    Ok(())
}

pub fn validate_output_path(path: &str) -> Result<()> {
    if path.is_empty() {
        anyhow::bail!("输出路径不能为空");
    }
    Ok(())
}

pub fn validate_config(config: &Config) -> Result<()> {
    validate_output_path(&config.download_dir)?;
    config.validate()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(is_valid_url("https://example.com"));
        assert!(is_valid_url("http://example.com/a?b=c"));
        assert!(!is_valid_url("invalid-url"));
        assert!(!is_valid_url("ftp://example.com/file"));
        assert!(!is_valid_url("mailto:someone@example.com"));
    }

    #[test]
    fn test_urls_validation() {
        let valid_urls = vec!["https://example.com".to_string(), "http://example.com".to_string()];
        assert!(validate_urls(&valid_urls).is_ok());

        let invalid_urls = vec!["invalid-url".to_string(), "https://example.com".to_string()];
        assert!(validate_urls(&invalid_urls).is_err());
        assert!(validate_urls(&[]).is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(validate_config(&Config::default()).is_ok());
        let config = Config { download_dir: String::new(), ..Config::default() };
        assert!(validate_config(&config).is_err());
    }
}
