//! Reminder text rendering.
//!
//! Templates carry four literal tokens: `{nome}`, `{produto}`, `{valor}` and
//! `{vencimento}`. Substitution is a single left-to-right pass, so values
//! that happen to contain a token are never expanded again.

use chrono::NaiveDate;
use dunning_core::Client;

const NO_PRODUCT: &str = "-";
const NO_VALUE: &str = "-";
const NO_DUE_DATE: &str = "Sem vencimento";

#[derive(Debug, Clone)]
pub struct MessageRenderer {
    currency_symbol: String,
    default_template: String,
}

impl MessageRenderer {
    pub fn new(currency_symbol: impl Into<String>, default_template: impl Into<String>) -> Self {
        Self {
            currency_symbol: currency_symbol.into(),
            default_template: default_template.into(),
        }
    }

    /// Render the reminder for `client`, falling back to the default template
    /// when the client has none. A linked payment key adds a details block.
    pub fn render(&self, client: &Client) -> String {
        let template = client
            .template
            .as_ref()
            .map(|template| template.content.as_str())
            .unwrap_or(&self.default_template);

        let product = client
            .product
            .as_ref()
            .map(|product| product.name.as_str())
            .unwrap_or(NO_PRODUCT);
        let value = client
            .product
            .as_ref()
            .map(|product| format_money(product.value_cents, &self.currency_symbol))
            .unwrap_or_else(|| NO_VALUE.to_string());
        let due = client
            .due_at
            .map(format_date)
            .unwrap_or_else(|| NO_DUE_DATE.to_string());

        let mut message = substitute(template, &client.name, product, &value, &due);

        if let Some(key) = &client.payment_key {
            message.push_str("\n\n");
            message.push_str(&format!(
                "Produto: {product}\nValor: {value}\nVencimento: {due}\nChave {}: {}",
                key.key_type, key.key_value
            ));
        }

        message
    }
}

fn substitute(template: &str, name: &str, product: &str, value: &str, due: &str) -> String {
    let tokens: [(&str, &str); 4] = [
        ("{nome}", name),
        ("{produto}", product),
        ("{valor}", value),
        ("{vencimento}", due),
    ];

    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        match tokens
            .iter()
            .find(|(token, _)| candidate.starts_with(token))
        {
            Some((token, replacement)) => {
                out.push_str(replacement);
                rest = &candidate[token.len()..];
            }
            None => {
                out.push('{');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// `12345` cents with `"R$"` becomes `"R$ 123,45"`; thousands use `.`.
pub fn format_money(cents: i64, symbol: &str) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    let units = (cents / 100).to_string();
    let fraction = cents % 100;

    let mut grouped = String::with_capacity(units.len() + units.len() / 3);
    for (i, digit) in units.chars().enumerate() {
        if i > 0 && (units.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(digit);
    }

    format!("{sign}{symbol} {grouped},{fraction:02}")
}

/// `dd/mm/yyyy`.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

#[cfg(test)]
mod tests {
    use dunning_test_support::fixtures::{client, date, payment_key, product, template};

    use super::*;

    fn renderer() -> MessageRenderer {
        MessageRenderer::new("R$", "Olá {nome}, sua fatura de {valor} vence em {vencimento}.")
    }

    #[test]
    fn test_renders_due_date_scenario() {
        let mut maria = client("c1", "u1", Some(date(2024, 5, 10)));
        maria.template = Some(template("Olá, {nome}! Vencimento {vencimento}."));
        maria.product = Some(product("Plano Mensal", 4990));

        assert_eq!(renderer().render(&maria), "Olá, Maria! Vencimento 10/05/2024.");
    }

    #[test]
    fn test_substitutes_every_token_in_any_order() {
        let mut maria = client("c1", "u1", Some(date(2024, 1, 5)));
        maria.template = Some(template(
            "{vencimento} | {valor} | {produto} | {nome} | {nome}",
        ));
        maria.product = Some(product("Consultoria", 123_456));

        assert_eq!(
            renderer().render(&maria),
            "05/01/2024 | R$ 1.234,56 | Consultoria | Maria | Maria"
        );
    }

    #[test]
    fn test_missing_links_use_placeholders() {
        let mut maria = client("c1", "u1", None);
        maria.template = Some(template("{produto} {valor} {vencimento}"));

        assert_eq!(renderer().render(&maria), "- - Sem vencimento");
    }

    #[test]
    fn test_default_template_when_client_has_none() {
        let mut maria = client("c1", "u1", Some(date(2024, 5, 10)));
        maria.product = Some(product("Plano", 4990));

        assert_eq!(
            renderer().render(&maria),
            "Olá Maria, sua fatura de R$ 49,90 vence em 10/05/2024."
        );
    }

    #[test]
    fn test_payment_key_appends_details_block() {
        let mut maria = client("c1", "u1", Some(date(2024, 5, 10)));
        maria.template = Some(template("Olá, {nome}!"));
        maria.product = Some(product("Plano", 4990));
        maria.payment_key = Some(payment_key("CPF", "123.456.789-00"));

        assert_eq!(
            renderer().render(&maria),
            "Olá, Maria!\n\nProduto: Plano\nValor: R$ 49,90\nVencimento: 10/05/2024\nChave CPF: 123.456.789-00"
        );
    }

    #[test]
    fn test_values_are_not_expanded_twice() {
        let mut tricky = client("c1", "u1", None);
        tricky.name = "{produto}".to_string();
        tricky.template = Some(template("{nome} {unknown} {"));

        assert_eq!(renderer().render(&tricky), "{produto} {unknown} {");
    }

    #[test]
    fn test_format_money() {
        assert_eq!(format_money(0, "R$"), "R$ 0,00");
        assert_eq!(format_money(5, "R$"), "R$ 0,05");
        assert_eq!(format_money(4990, "R$"), "R$ 49,90");
        assert_eq!(format_money(100_000, "R$"), "R$ 1.000,00");
        assert_eq!(format_money(123_456_789, "R$"), "R$ 1.234.567,89");
        assert_eq!(format_money(-1050, "€"), "-€ 10,50");
    }
}
