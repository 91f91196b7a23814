//! 应用层协议协商（ALPN）。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 协商结果只取决于双方的报价列表，写成纯函数后既可在服务端握手中直接使用，也便于属性测试；
//! - 服务端在读到 ClientHello 之后才知道客户端报价，因此由会话在握手中途调用 [`negotiate`]，
//!   再把唯一的结果交给后端，避免后端按“服务端偏好”自行挑选。
//!
//! ## 契约（What）
//! - 结果为客户端列表中**第一个**同时出现在服务端列表中的协议名；
//! - 服务端列表只做“是否包含”的过滤，其顺序不影响结果；
//! - 任一方列表为空（未报价）时结果为 `None`。

/// 按客户端偏好选择协议。
pub fn negotiate<'c, C, S>(client_offer: &'c [C], server_offer: &[S]) -> Option<&'c C>
where
    C: AsRef<[u8]>,
    S: AsRef<[u8]>,
{
    client_offer.iter().find(|candidate| {
        server_offer
            .iter()
            .any(|supported| supported.as_ref() == candidate.as_ref())
    })
}

/// 把字符串报价转换为线路格式。
pub(crate) fn to_wire<S: AsRef<str>>(offer: &[S]) -> Vec<Vec<u8>> {
    offer
        .iter()
        .map(|name| name.as_ref().as_bytes().to_vec())
        .filter(|name| !name.is_empty())
        .collect()
}
