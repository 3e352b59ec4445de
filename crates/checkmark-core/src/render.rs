use std::io::{self, IsTerminal, Write};

use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::theme::{Palette, Theme};
use crate::todo::{Priority, Todo, priority_color, priority_label};

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let color = cfg.color()? && io::stdout().is_terminal();
        Ok(Self { color })
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    #[tracing::instrument(skip_all, fields(count = todos.len()))]
    pub fn print_todo_table(&self, todos: &[Todo], palette: &Palette) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        self.write_todo_table(&mut out, todos, palette)
    }

    pub fn write_todo_table<W: Write>(
        &self,
        mut out: W,
        todos: &[Todo],
        palette: &Palette,
    ) -> anyhow::Result<()> {
        if todos.is_empty() {
            writeln!(out, "No todos.")?;
            return Ok(());
        }

        let headers = vec![
            "ID".to_string(),
            "Done".to_string(),
            "Priority".to_string(),
            "Title".to_string(),
        ];

        let rows = todos
            .iter()
            .map(|todo| {
                let done = if todo.completed {
                    self.paint("[x]", palette.success)
                } else {
                    "[ ]".to_string()
                };
                let priority = self.paint(
                    &priority_label(todo.priority).to_uppercase(),
                    priority_color(todo.priority),
                );
                vec![
                    self.paint(&todo.id, palette.primary),
                    done,
                    priority,
                    todo.title.clone(),
                ]
            })
            .collect();

        write_table(&mut out, headers, rows)?;
        let open = todos.iter().filter(|todo| !todo.completed).count();
        writeln!(out)?;
        writeln!(out, "{} todos, {open} open.", todos.len())?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(id = %todo.id))]
    pub fn print_todo_info(&self, todo: &Todo, palette: &Palette) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        self.write_todo_info(&mut out, todo, palette)
    }

    pub fn write_todo_info<W: Write>(
        &self,
        mut out: W,
        todo: &Todo,
        palette: &Palette,
    ) -> anyhow::Result<()> {
        writeln!(out, "id        {}", self.paint(&todo.id, palette.primary))?;
        writeln!(out, "title     {}", todo.title)?;
        writeln!(
            out,
            "priority  {}",
            self.paint(priority_label(todo.priority), priority_color(todo.priority))
        )?;
        let status = if todo.completed {
            self.paint("completed", palette.success)
        } else {
            "pending".to_string()
        };
        writeln!(out, "status    {status}")?;
        Ok(())
    }

    pub fn print_theme(&self, theme: Theme, persisted: bool) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let durability = if persisted { "saved" } else { "this session only" };
        writeln!(out, "theme     {theme} ({durability})")?;
        for (name, hex) in theme.palette().entries() {
            writeln!(out, "{name:<10}{}", self.paint(hex, hex))?;
        }
        Ok(())
    }

    pub fn print_priorities(&self) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();
        let headers = vec!["Key".to_string(), "Label".to_string(), "Color".to_string()];
        let rows = Priority::ALL
            .iter()
            .map(|priority| {
                vec![
                    priority.as_str().to_string(),
                    self.paint(priority.label(), priority.color()),
                    priority.color().to_string(),
                ]
            })
            .collect();
        write_table(&mut out, headers, rows)
    }

    fn paint(&self, text: &str, hex: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        match hex_to_rgb(hex) {
            Some((r, g, b)) => format!("\x1b[38;2;{r};{g};{b}m{text}\x1b[0m"),
            None => text.to_string(),
        }
    }
}

fn hex_to_rgb(hex: &str) -> Option<(u8, u8, u8)> {
    let digits = hex.strip_prefix('#')?;
    if digits.len() != 6 {
        return None;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(digits.get(range)?, 16).ok();
    Some((channel(0..2)?, channel(2..4)?, channel(4..6)?))
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let mut widths: Vec<usize> = headers
        .iter()
        .map(|header| UnicodeWidthStr::width(header.as_str()))
        .collect();

    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for (header, &width) in headers.iter().zip(&widths) {
        write!(writer, "{header:width$} ")?;
    }
    writeln!(writer)?;

    for &width in &widths {
        write!(writer, "{:-<width$} ", "")?;
    }
    writeln!(writer)?;

    for row in rows {
        for (cell, &width) in row.iter().zip(&widths) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = width.saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::{Renderer, hex_to_rgb, strip_ansi, write_table};
    use crate::theme::Theme;
    use crate::todo::{Priority, Todo};

    #[test]
    fn hex_colors_parse() {
        assert_eq!(hex_to_rgb("#FF3B30"), Some((255, 59, 48)));
        assert_eq!(hex_to_rgb("FF3B30"), None);
        assert_eq!(hex_to_rgb("#FFF"), None);
    }

    #[test]
    fn table_pads_by_visible_width() {
        let mut buf = Vec::new();
        write_table(
            &mut buf,
            vec!["A".to_string(), "B".to_string()],
            vec![vec!["\x1b[31mred\x1b[0m".to_string(), "x".to_string()]],
        )
        .expect("write table");
        let text = String::from_utf8(buf).expect("utf8");
        let lines: Vec<_> = text.lines().map(strip_ansi).collect();
        assert_eq!(lines, vec!["A   B ", "--- - ", "red x "]);
    }

    #[test]
    fn todo_table_lists_priority_and_status() {
        let mut done = Todo::new("2".to_string(), "Call mom".to_string(), None);
        done.completed = true;
        let todos = vec![
            Todo::new("1".to_string(), "Buy milk".to_string(), Some(Priority::High)),
            done,
        ];

        let mut buf = Vec::new();
        Renderer::plain()
            .write_todo_table(&mut buf, &todos, Theme::Light.palette())
            .expect("render");
        let text = String::from_utf8(buf).expect("utf8");

        assert!(text.contains("HIGH"));
        assert!(text.contains("NO PRIORITY"));
        assert!(text.contains("[x]"));
        assert!(text.contains("2 todos, 1 open."));
    }
}
