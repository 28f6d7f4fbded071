use crate::models::CanonicalError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// 调用方传入的请求不满足前置条件，在发起网络请求之前返回
    #[error("Invalid request: {0}")]
    Contract(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    /// 上游返回非 2xx 且响应体无法识别为供应商错误
    #[error("Upstream returned error status {status}: {body}")]
    Upstream { status: u16, body: String },

    /// 供应商错误片段经 ErrorMapper 映射后的规范错误
    #[error("Vendor error {}: {}", .error.error_type, .error.message)]
    Vendor { status: u16, error: CanonicalError },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// 面向网关调用方的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Contract(_) => 400,
            Self::Vendor { status, .. } | Self::Upstream { status, .. } => *status,
            Self::Http(_) | Self::Serialization(_) => 502,
            Self::Config(_) | Self::Proxy(_) | Self::Io(_) => 500,
        }
    }

    /// 转换为 OpenAI 风格的错误结构
    pub fn to_canonical(&self) -> CanonicalError {
        match self {
            Self::Vendor { error, .. } => error.clone(),
            Self::Contract(msg) => CanonicalError::new(msg.clone(), "invalid_request_error"),
            Self::Upstream { .. } | Self::Http(_) => {
                CanonicalError::new(self.to_string(), "upstream_error")
            }
            Self::Serialization(_) => CanonicalError::new(self.to_string(), "decode_error"),
            Self::Config(_) | Self::Proxy(_) | Self::Io(_) => {
                CanonicalError::new(self.to_string(), "gateway_error")
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_error_keeps_carried_status_and_shape() {
        let err = Error::Vendor {
            status: 400,
            error: CanonicalError {
                message: "bad input".to_string(),
                error_type: "InvalidParameter".to_string(),
                param: Some("req-1".to_string()),
                code: Some("InvalidParameter".to_string()),
            },
        };

        assert_eq!(err.status_code(), 400);
        let canonical = err.to_canonical();
        assert_eq!(canonical.code.as_deref(), Some("InvalidParameter"));
        assert_eq!(canonical.param.as_deref(), Some("req-1"));
    }

    #[test]
    fn contract_error_is_client_side() {
        let err = Error::Contract("no messages".to_string());
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.to_canonical().error_type, "invalid_request_error");
    }

    #[test]
    fn decode_error_maps_to_bad_gateway() {
        let err: Error = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(err.status_code(), 502);
        assert_eq!(err.to_canonical().error_type, "decode_error");
    }
}
