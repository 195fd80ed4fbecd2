//! HTML pages served by `GET /verify-email`.

use axum::response::Html;

/// Which page to show after a verification link is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPage {
    Verified,
    AlreadyVerified,
    Invalid,
}

pub fn verify_page(page: VerifyPage, frontend_url: &str) -> Html<String> {
    let base = frontend_url.trim_end_matches('/');
    let (title, color, body, link, link_text) = match page {
        VerifyPage::Verified => (
            "Email Verified Successfully!",
            "#28a745",
            "Your email has been verified. You can now close this window and log in.",
            base.to_string(),
            "Go to Login",
        ),
        VerifyPage::AlreadyVerified => (
            "Email Already Verified",
            "#28a745",
            "Your email has already been verified. You can close this window and log in.",
            base.to_string(),
            "Go to Login",
        ),
        VerifyPage::Invalid => (
            "Invalid Verification Link",
            "#dc3545",
            "This verification link is invalid or has expired.",
            format!("{}/signup", base),
            "Sign Up Again",
        ),
    };
    Html(format!(
        r#"<html>
  <body style="font-family: Arial, sans-serif; text-align: center; padding: 50px;">
    <h2 style="color: {color};">{title}</h2>
    <p>{body}</p>
    <a href="{link}" style="display: inline-block; padding: 10px 20px; background: #007bff; color: white; text-decoration: none; border-radius: 5px;">{link_text}</a>
  </body>
</html>
"#
    ))
}
