use anyhow::Result;
use log::info;
use std::{fs, path::Path};
use tera::{Context, Tera};
use uuid::Uuid;

use crate::exports::{Export, ExportTable};

const PROXY_SOURCE_TEMPLATE: &str = include_str!("templates/proxy_source");
const MODULE_DEF_TEMPLATE: &str = include_str!("templates/module_def");
const SOLUTION_TEMPLATE: &str = include_str!("templates/solution");
const VCXPROJ_TEMPLATE: &str = include_str!("templates/vcxproj");
const VCXPROJ_FILTERS_TEMPLATE: &str = include_str!("templates/vcxproj_filters");
const VCXPROJ_USER_TEMPLATE: &str = include_str!("templates/vcxproj_user");

/// Visual C++ project type, fixed by Visual Studio.
const CPP_PROJECT_TYPE_GUID: &str = "{8BC9CEB8-8B4A-11D0-8D11-00A0C91BC942}";

fn fresh_guid() -> String {
    Uuid::new_v4().to_string().to_uppercase()
}

/// Internal name of the forwarding stub for an ordinal.
fn stub_name(ordinal: u32) -> String {
    format!("__E__{ordinal}__")
}

/// Ordinal N owns slot N of the pointer table, stored at index N - 1 so the
/// largest ordinal stays inside the `max_ordinal`-sized table.
fn slot_index(ordinal: u32) -> u32 {
    ordinal - 1
}

fn proc_address_line(export: &Export) -> String {
    format!(
        r#"        p[{}] = (UINT_PTR)GetProcAddress(hL, "{}");"#,
        slot_index(export.ordinal),
        export.mangled_name
    )
}

/// A naked stub: no prologue, no epilogue, just an indirect jump through the
/// resolved address so the original sees the caller's frame untouched.
fn stub_function(export: &Export) -> String {
    let name = stub_name(export.ordinal);
    let offset = slot_index(export.ordinal);
    let linkage = if export.is_decorated() {
        r#"extern "C" __declspec(naked) __declspec(dllexport)"#
    } else {
        r#"extern "C" __declspec(naked)"#
    };
    format!(
        r#"
{linkage} void __stdcall {name}()
{{
    __asm
    {{
        jmp p[{offset} * 4];
    }}
}}
"#
    )
}

/// One EXPORTS line. Decorated symbols alias the mangled name to the stub's
/// own stdcall-decorated form (underscore prefix, zero argument bytes).
fn def_line(export: &Export) -> String {
    let stub = stub_name(export.ordinal);
    if export.is_decorated() {
        format!(
            "{}=_{}@0 @{}\n",
            export.mangled_name, stub, export.ordinal
        )
    } else {
        format!("{}={} @{}\n", export.mangled_name, stub, export.ordinal)
    }
}

pub struct ProxyTemplates {
    tera: Tera,
}

impl ProxyTemplates {
    pub fn new() -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_template("proxy_source", PROXY_SOURCE_TEMPLATE)?;
        tera.add_raw_template("module_def", MODULE_DEF_TEMPLATE)?;
        tera.add_raw_template("solution", SOLUTION_TEMPLATE)?;
        tera.add_raw_template("vcxproj", VCXPROJ_TEMPLATE)?;
        tera.add_raw_template("vcxproj_filters", VCXPROJ_FILTERS_TEMPLATE)?;
        tera.add_raw_template("vcxproj_user", VCXPROJ_USER_TEMPLATE)?;

        Ok(Self { tera })
    }

    /// The forwarding translation unit: pointer table, DllMain that resolves
    /// every export out of `ori_<target>` on attach, and one stub per export.
    pub fn get_proxy_source(
        &self,
        table: &ExportTable,
        target_file_name: &str,
    ) -> Result<String> {
        let proc_addresses: String = table
            .exports
            .iter()
            .map(|export| proc_address_line(export))
            .collect::<Vec<_>>()
            .join("\n");
        let stubs: String = table.exports.iter().map(stub_function).collect();

        let mut ctx = Context::new();
        ctx.insert("max_ordinal", &table.max_ordinal);
        ctx.insert("target_file_name", target_file_name);
        ctx.insert("proc_addresses", &proc_addresses);
        ctx.insert("stubs", &stubs);
        Ok(self.tera.render("proxy_source", &ctx)?)
    }

    pub fn get_module_def(&self, table: &ExportTable, library_name: &str) -> Result<String> {
        let exports: String = table.exports.iter().map(def_line).collect();

        let mut ctx = Context::new();
        ctx.insert("library_name", library_name);
        ctx.insert("exports", &exports);
        Ok(self.tera.render("module_def", &ctx)?)
    }

    pub fn get_solution(&self, project_name: &str, project_guid: &str) -> Result<String> {
        let mut ctx = Context::new();
        ctx.insert("project_type_guid", CPP_PROJECT_TYPE_GUID);
        ctx.insert("project_name", project_name);
        ctx.insert("project_guid", project_guid);
        Ok(self.tera.render("solution", &ctx)?)
    }

    pub fn get_vcxproj(
        &self,
        project_name: &str,
        project_guid: &str,
        cpp_filename: &str,
        def_filename: &str,
    ) -> Result<String> {
        let mut ctx = Context::new();
        ctx.insert("project_name", project_name);
        ctx.insert("project_name_upper", &project_name.to_uppercase());
        ctx.insert("project_guid", project_guid);
        ctx.insert("cpp_filename", cpp_filename);
        ctx.insert("def_filename", def_filename);
        Ok(self.tera.render("vcxproj", &ctx)?)
    }

    pub fn get_vcxproj_filters(&self, cpp_filename: &str, def_filename: &str) -> Result<String> {
        let mut ctx = Context::new();
        ctx.insert("source_filter_uuid", &fresh_guid());
        ctx.insert("header_filter_uuid", &fresh_guid());
        ctx.insert("resource_filter_uuid", &fresh_guid());
        ctx.insert("cpp_filename", cpp_filename);
        ctx.insert("def_filename", def_filename);
        Ok(self.tera.render("vcxproj_filters", &ctx)?)
    }

    pub fn get_vcxproj_user(&self) -> Result<String> {
        Ok(self.tera.render("vcxproj_user", &Context::new())?)
    }
}

/// Writes the whole project tree under `out_dir`, wiping any previous run.
pub fn create_proxy_project(
    table: &ExportTable,
    target_file_name: &str,
    out_dir: &Path,
) -> Result<()> {
    let project_name = target_file_name
        .strip_suffix(".dll")
        .unwrap_or(target_file_name);
    let project_dir = out_dir.join(project_name);

    if out_dir.exists() {
        fs::remove_dir_all(out_dir)?;
    }
    fs::create_dir_all(&project_dir)?;

    let cpp_filename = format!("{project_name}_proxy.cpp");
    let def_filename = format!("{project_name}_proxy.def");

    let templates = ProxyTemplates::new()?;
    let project_guid = fresh_guid();

    fs::write(
        out_dir.join(format!("{project_name}.sln")),
        templates.get_solution(project_name, &project_guid)?,
    )?;
    fs::write(
        project_dir.join(format!("{project_name}.vcxproj")),
        templates.get_vcxproj(project_name, &project_guid, &cpp_filename, &def_filename)?,
    )?;
    fs::write(
        project_dir.join(format!("{project_name}.vcxproj.filters")),
        templates.get_vcxproj_filters(&cpp_filename, &def_filename)?,
    )?;
    fs::write(
        project_dir.join(format!("{project_name}.vcxproj.user")),
        templates.get_vcxproj_user()?,
    )?;
    fs::write(
        project_dir.join(&cpp_filename),
        templates.get_proxy_source(table, target_file_name)?,
    )?;
    fs::write(
        project_dir.join(&def_filename),
        templates.get_module_def(table, project_name)?,
    )?;

    info!(
        "Wrote proxy project '{}' to {}",
        project_name,
        out_dir.display()
    );
    Ok(())
}
