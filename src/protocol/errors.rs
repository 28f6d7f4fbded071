use crate::models::CanonicalError;
use crate::protocol::dashscope::DashScopeError;

/// 将供应商错误片段映射为规范错误
///
/// code 为空时返回 None（供应商约定的"无错误"）。
/// code 同时作为 type 和 code，request_id 非空时作为诊断用的 param。
pub fn map_error(error: &DashScopeError) -> Option<CanonicalError> {
    if error.is_empty() {
        return None;
    }

    Some(CanonicalError {
        message: error.message.clone(),
        error_type: error.code.clone(),
        param: Some(error.request_id.clone()).filter(|id| !id.is_empty()),
        code: Some(error.code.clone()),
    })
}
