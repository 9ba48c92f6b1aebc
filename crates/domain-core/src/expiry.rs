//! 过期语义

/// 带有绝对过期时间的实体
pub trait Expiring {
    fn expires_at(&self) -> chrono::DateTime<chrono::Utc>;

    fn is_expired_at(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now >= self.expires_at()
    }

    fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now())
    }
}
