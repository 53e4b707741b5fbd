use super::runner::{Compilable, LanguageRunner, Runnable, StageCommand};
use crate::job::Language;

/// C++ compiled to a native executable named after the source file
pub struct Cpp;

/// Java compiled to bytecode; the file name doubles as the main class
pub struct Java;

/// Python run directly by the interpreter
pub struct Python;

impl Runnable for Cpp {
    fn extension(&self) -> &'static str {
        "cpp"
    }

    fn run_command(&self, file_name: &str) -> StageCommand {
        StageCommand::new(format!("./{file_name}"), Vec::<String>::new())
    }
}

impl Compilable for Cpp {
    fn compile_command(&self, file_name: &str) -> StageCommand {
        StageCommand::new(
            "g++",
            [
                "-std=c++17".to_string(),
                "-O2".to_string(),
                "-o".to_string(),
                file_name.to_string(),
                self.source_file(file_name),
            ],
        )
    }
}

impl LanguageRunner for Cpp {
    fn as_compilable(&self) -> Option<&dyn Compilable> {
        Some(self)
    }
}

impl Runnable for Java {
    fn extension(&self) -> &'static str {
        "java"
    }

    fn run_command(&self, file_name: &str) -> StageCommand {
        StageCommand::new("java", ["-cp", ".", file_name])
    }
}

impl Compilable for Java {
    fn compile_command(&self, file_name: &str) -> StageCommand {
        StageCommand::new("javac", [self.source_file(file_name)])
    }
}

impl LanguageRunner for Java {
    fn as_compilable(&self) -> Option<&dyn Compilable> {
        Some(self)
    }
}

impl Runnable for Python {
    fn extension(&self) -> &'static str {
        "py"
    }

    fn run_command(&self, file_name: &str) -> StageCommand {
        StageCommand::new("python3", [self.source_file(file_name)])
    }
}

impl LanguageRunner for Python {}

pub fn runner_for(language: Language) -> Box<dyn LanguageRunner> {
    match language {
        Language::Cpp => Box::new(Cpp),
        Language::Java => Box::new(Java),
        Language::Python => Box::new(Python),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cpp_commands() {
        let cpp = runner_for(Language::Cpp);
        assert_eq!(cpp.source_file("main"), "main.cpp");
        let compiler = cpp.as_compilable().unwrap();
        assert_eq!(
            compiler.compile_command("main").to_string(),
            "g++ -std=c++17 -O2 -o main main.cpp"
        );
        assert_eq!(cpp.run_command("main").to_string(), "./main");
    }

    #[test]
    fn test_java_commands() {
        let java = runner_for(Language::Java);
        assert_eq!(
            java.as_compilable().unwrap().compile_command("Main").to_string(),
            "javac Main.java"
        );
        assert_eq!(java.run_command("Main").to_string(), "java -cp . Main");
    }

    #[test]
    fn test_python_has_no_compile_stage() {
        let python = runner_for(Language::Python);
        assert!(python.as_compilable().is_none());
        assert_eq!(python.source_file("main"), "main.py");
        assert_eq!(
            python.run_command("main"),
            StageCommand::new("python3", ["main.py"])
        );
    }
}
